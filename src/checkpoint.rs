use crate::config::{INITIAL_LEARNING_RATE, MODEL_CONFIG_NAME, PARAMS_NAME};
use crate::error::{Error, Result};
use crate::model::{Seq2SeqConfig, Seq2SeqLstm};
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

type ParamsRecorder = BinFileRecorder<FullPrecisionSettings>;

// ===== 訓練状態の記録 =====

/// エポックをまたいで引き継ぐ訓練状態
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainerState {
    pub epoch: usize,
    pub best_loss: f64,
    pub learning_rate: f64,
    /// 連続して損失が改善しなかったエポック数
    pub stall_count: usize,
}

impl Default for TrainerState {
    fn default() -> Self {
        Self {
            epoch: 0,
            best_loss: f64::INFINITY,
            learning_rate: INITIAL_LEARNING_RATE,
            stall_count: 0,
        }
    }
}

impl TrainerState {
    /// `epoch best_loss learning_rate stall_count` 形式の1行
    pub fn to_line(&self) -> String {
        format!(
            "{} {:.10} {:.10} {}",
            self.epoch, self.best_loss, self.learning_rate, self.stall_count
        )
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(Error::Checkpoint(format!("フィールド数が4ではありません: {:?}", line)));
        }

        let malformed = |name: &str| Error::Checkpoint(format!("{} が不正です: {:?}", name, line));

        Ok(Self {
            epoch: fields[0].parse().map_err(|_| malformed("epoch"))?,
            best_loss: fields[1].parse().map_err(|_| malformed("best_loss"))?,
            learning_rate: fields[2].parse().map_err(|_| malformed("learning_rate"))?,
            stall_count: fields[3].parse().map_err(|_| malformed("stall_count"))?,
        })
    }
}

/// チェックポイント記録に1行追記（切り詰めはしない）
pub fn append_checkpoint<P: AsRef<Path>>(path: P, state: &TrainerState) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", state.to_line())?;

    Ok(())
}

/// チェックポイント記録の最終行を読み込む（ファイルがなければ `None`）
pub fn load_checkpoint<P: AsRef<Path>>(path: P) -> Result<Option<TrainerState>> {
    let path = path.as_ref();
    if !path.is_file() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .last()
        .map(TrainerState::parse_line)
        .transpose()
}

// ===== モデルパラメータ =====

/// モデルの形状設定とパラメータを保存
pub fn save_model<B: Backend>(
    model: &Seq2SeqLstm<B>,
    config: &Seq2SeqConfig,
    save_dir: &Path,
) -> Result<()> {
    fs::create_dir_all(save_dir)?;

    config.save(save_dir.join(MODEL_CONFIG_NAME))?;

    let recorder = ParamsRecorder::new();
    model
        .clone()
        .save_file(save_dir.join(PARAMS_NAME), &recorder)
        .map_err(|e| Error::Record(format!("{:?}", e)))?;

    log::info!("モデルを保存: {}", save_dir.display());
    Ok(())
}

/// 保存済みの形状設定を読み込む
pub fn load_config(load_dir: &Path) -> Result<Seq2SeqConfig> {
    Seq2SeqConfig::load(load_dir.join(MODEL_CONFIG_NAME))
        .map_err(|e| Error::Config(format!("{:?}", e)))
}

/// パラメータが保存されているか
pub fn params_exist(dir: &Path) -> bool {
    dir.join(PARAMS_NAME).with_extension("bin").is_file()
}

/// 指定した形状設定でモデルを読み込む
///
/// 保存時の設定、読み込んだパラメータの形状のどちらかが一致しなければ `ShapeMismatch`。
pub fn load_model<B: Backend>(
    load_dir: &Path,
    config: &Seq2SeqConfig,
    device: &B::Device,
) -> Result<Seq2SeqLstm<B>> {
    let stored = load_config(load_dir)?;
    check_same_shape(config, &stored)?;

    let recorder = ParamsRecorder::new();
    let model = config
        .init::<B>(device)
        .load_file(load_dir.join(PARAMS_NAME), &recorder, device)
        .map_err(|e| Error::Record(format!("{:?}", e)))?;
    model.check_config(config)?;

    log::info!(
        "モデルを読み込み（{}バックエンド）: {}",
        std::any::type_name::<B>(),
        load_dir.display()
    );
    Ok(model)
}

fn check_same_shape(expected: &Seq2SeqConfig, stored: &Seq2SeqConfig) -> Result<()> {
    let pairs = [
        ("語彙サイズ", expected.vocab_size, stored.vocab_size),
        ("埋め込み次元", expected.embed_size, stored.embed_size),
        ("隠れ状態の次元", expected.hidden_size, stored.hidden_size),
        ("レイヤー数", expected.num_layers, stored.num_layers),
    ];

    for (what, expected, actual) in pairs {
        if expected != actual {
            return Err(Error::ShapeMismatch {
                what,
                expected,
                actual,
            });
        }
    }

    Ok(())
}
