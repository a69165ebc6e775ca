// モデルハイパーパラメーター
pub const EMBED_SIZE: usize = 128; // 埋め込み次元
pub const HIDDEN_SIZE: usize = 1024; // LSTM隠れ状態の次元
pub const NUM_LAYERS: usize = 2; // LSTMのレイヤー数
pub const DROPOUT: f64 = 0.5; // 出力射影前のドロップアウト率

// データ設定
pub const SEQUENCE_LENGTH: usize = 32; // 最大シーケンス長（これを超える対句は除外）
pub const BATCH_SIZE: usize = 64; // バッチサイズ

// 訓練設定
pub const INITIAL_LEARNING_RATE: f64 = 0.001; // 初期学習率
pub const MIN_LEARNING_RATE: f64 = 1e-8; // これを下回ったら訓練終了
pub const MAX_STALL_EPOCHS: usize = 2; // 改善なしエポックがこれを超えたら学習率を半減
pub const LEARNING_RATE_DECAY: f64 = 0.5; // 学習率の減衰係数
pub const GRADIENT_CLIP: f32 = 5.0; // 勾配クリッピングの閾値
pub const SGD_MOMENTUM: f64 = 0.5; // SGD使用時のモーメンタム

// ファイルパス
pub const CORPUS_PATH: &str = "data/couplets.conv";
pub const VOCAB_PATH: &str = "data/vocabulary.json";
pub const MODEL_DIR: &str = "model";
pub const PARAMS_NAME: &str = "seq2seq_lstm"; // BinFileRecorderが拡張子 .bin を付与
pub const CHECKPOINT_NAME: &str = "seq2seq_lstm.ckpt";
pub const MODEL_CONFIG_NAME: &str = "config.json";
pub const METRICS_NAME: &str = "metrics.json";
