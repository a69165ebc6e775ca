use burn::backend::ndarray::NdArray;
use burn::backend::wgpu::{Wgpu, WgpuDevice};
use burn::backend::Autodiff;
use clap::Parser;
use coupletbot::config::{
    BATCH_SIZE, CORPUS_PATH, DROPOUT, EMBED_SIZE, HIDDEN_SIZE, MODEL_DIR, NUM_LAYERS,
    SEQUENCE_LENGTH, VOCAB_PATH,
};
use coupletbot::export::export_attention_to_csv;
use coupletbot::inference::run_inference;
use coupletbot::training::{run_with_recovery, shuffle_rng, train, TrainingConfig};
use coupletbot::vocabulary::Vocabulary;
use env_logger::Env;
use std::path::PathBuf;
use std::time::Instant;

/// 対句（対联）生成用 Attention付き Seq2Seq LSTM
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 訓練モード（チェックポイントがあれば再開）
    #[arg(long)]
    train: bool,

    /// Adamの代わりにモーメンタム付きSGDを使う
    #[arg(long)]
    sgd: bool,

    /// 会話コーパスのパス
    #[arg(long, default_value = CORPUS_PATH)]
    data: PathBuf,

    /// 語彙ファイルのパス
    #[arg(long, default_value = VOCAB_PATH)]
    vocab: PathBuf,

    /// モデル（パラメータ・チェックポイント・メトリクス）のディレクトリ
    #[arg(long, default_value = MODEL_DIR)]
    model_dir: PathBuf,

    /// 上の句を与えて下の句を生成
    #[arg(long)]
    predict: Option<String>,

    /// バックエンドの選択（wgpu, ndarray）
    #[arg(long, default_value = "wgpu")]
    backend: String,

    /// Attention行列をCSVエクスポート（推論時のみ）
    #[arg(long)]
    export_attn: bool,

    #[arg(long, default_value_t = EMBED_SIZE)]
    embed_size: usize,

    #[arg(long, default_value_t = HIDDEN_SIZE)]
    hidden_size: usize,

    #[arg(long, default_value_t = NUM_LAYERS)]
    num_layers: usize,

    #[arg(long, default_value_t = DROPOUT)]
    dropout: f64,

    #[arg(long, default_value_t = BATCH_SIZE)]
    batch_size: usize,

    /// 最大シーケンス長（バケット境界もこれから決まる）
    #[arg(long, default_value_t = SEQUENCE_LENGTH)]
    sequence_length: usize,

    /// シャッフル用の乱数シード
    #[arg(long)]
    seed: Option<u64>,

    /// このエポック数に達したら訓練を終了
    #[arg(long)]
    max_epochs: Option<usize>,
}

impl Args {
    fn training_config(&self) -> TrainingConfig {
        TrainingConfig {
            corpus_path: self.data.clone(),
            vocab_path: self.vocab.clone(),
            model_dir: self.model_dir.clone(),
            embed_size: self.embed_size,
            hidden_size: self.hidden_size,
            num_layers: self.num_layers,
            dropout: self.dropout,
            batch_size: self.batch_size,
            sequence_length: self.sequence_length,
            use_sgd: self.sgd,
            seed: self.seed,
            max_epochs: self.max_epochs,
        }
    }
}

fn init_logger() {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder.format_timestamp_millis();
    let _ = builder.try_init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logger();
    let start_time = Instant::now();

    let args = Args::parse();

    // 訓練モード（NaN で発散したら最後のチェックポイントからやり直す）
    if args.train {
        println!("\n===== 訓練開始 =====");
        let config = args.training_config();
        let mut rng = shuffle_rng(config.seed);

        let state = match args.backend.as_str() {
            "wgpu" => {
                let device = WgpuDevice::default();
                run_with_recovery(|| train::<Autodiff<Wgpu>>(&config, &device, &mut rng))?
            }
            "ndarray" => {
                let device = Default::default();
                run_with_recovery(|| train::<Autodiff<NdArray>>(&config, &device, &mut rng))?
            }
            other => return Err(format!("未対応のバックエンド: {}", other).into()),
        };

        println!("訓練完了: {}", state.to_line());
    }

    // 推論モード
    if let Some(predict_text) = &args.predict {
        println!("\n===== 推論 =====");
        let vocab = Vocabulary::load(&args.vocab)?;
        let reply = run_inference(
            &args.backend,
            &args.model_dir,
            &vocab,
            predict_text,
            args.sequence_length,
        )?;
        println!("上の句: {} → 下の句: {}", predict_text, reply.text);

        if args.export_attn {
            export_attention_to_csv(&reply, &vocab, &args.model_dir, "attention")?;
        }
    }

    if !args.train && args.predict.is_none() {
        println!("使用方法:");
        println!("  訓練: cargo run --release -- --train");
        println!("  SGDで訓練: cargo run --release -- --train --sgd");
        println!("  推論: cargo run --release -- --predict \"春风得意\" --backend ndarray");
    }

    let duration = start_time.elapsed();
    println!("\n実行時間: {:.2}秒", duration.as_secs_f64());

    Ok(())
}
