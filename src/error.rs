use thiserror::Error;

/// クレート共通のエラー
#[derive(Debug, Error)]
pub enum Error {
    /// 語彙に存在しない文字（推論時の未知文字など）
    #[error("未知の文字です: {0:?}")]
    UnknownCharacter(char),

    /// 語彙の範囲外、または文字を表さないID
    #[error("無効なトークンID: {0}")]
    InvalidId(usize),

    /// モデル部品間の形状不一致（プログラミングエラー）
    #[error("形状不一致 ({what}): 期待値 {expected}, 実際 {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// 損失が NaN になった（プロセスレベルで再起動して回復する）
    #[error("損失が NaN になりました (epoch {epoch}, batch {batch})")]
    DivergedLoss { epoch: usize, batch: usize },

    #[error("フィルタ後のデータセットが空です")]
    EmptyDataset,

    /// チェックポイント記録の行が壊れている
    #[error("チェックポイント記録が不正です: {0}")]
    Checkpoint(String),

    /// burn のレコーダーによる保存・読み込みの失敗
    #[error("モデルパラメータの保存/読み込みに失敗: {0}")]
    Record(String),

    #[error("設定ファイルの読み込みに失敗: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
