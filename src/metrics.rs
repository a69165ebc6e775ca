use crate::config::METRICS_NAME;
use crate::error::Result;
use crate::model::Seq2SeqConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// 1エポック分の訓練メトリクス
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub learning_rate: f64,
    /// バッチ平均損失のエポック平均
    pub loss: f64,
    pub perplexity: f64,
    pub stall_count: usize,
    pub duration_secs: f64,
}

/// ラベル数で重み付けしたクロスエントロピーからパープレキシティを求める
#[derive(Debug, Default, Clone)]
pub struct Perplexity {
    total_nll: f64,
    count: usize,
}

impl Perplexity {
    /// mean_loss: バッチ内ラベルの平均負対数尤度
    pub fn update(&mut self, mean_loss: f64, num_labels: usize) {
        self.total_nll += mean_loss * num_labels as f64;
        self.count += num_labels;
    }

    pub fn value(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        (self.total_nll / self.count as f64).exp()
    }
}

/// メタデータ
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Metadata {
    pub crate_version: String,
    pub updated_at: String,
}

/// metrics.json の内容
#[derive(Serialize, Deserialize, Debug)]
pub struct MetricsFile {
    pub model_config: Seq2SeqConfig,
    pub history: Vec<EpochMetrics>,
    pub metadata: Metadata,
}

/// エポック履歴を metrics.json に保存（毎エポック上書き）
pub fn save_metrics(
    save_dir: &Path,
    model_config: &Seq2SeqConfig,
    history: &[EpochMetrics],
) -> Result<()> {
    fs::create_dir_all(save_dir)?;

    let metadata = Metadata {
        crate_version: env!("CARGO_PKG_VERSION").to_string(),
        updated_at: chrono::Local::now().to_rfc3339(),
    };

    let metrics_file = MetricsFile {
        model_config: model_config.clone(),
        history: history.to_vec(),
        metadata,
    };

    let path = save_dir.join(METRICS_NAME);
    fs::write(&path, serde_json::to_string_pretty(&metrics_file)?)?;
    log::debug!("メトリクスを保存: {}", path.display());

    Ok(())
}

/// 保存済みのエポック履歴（再開時に引き継ぐ）
pub fn load_history(save_dir: &Path) -> Result<Vec<EpochMetrics>> {
    let path = save_dir.join(METRICS_NAME);
    if !path.is_file() {
        return Ok(Vec::new());
    }

    let metrics_file: MetricsFile = serde_json::from_str(&fs::read_to_string(path)?)?;
    Ok(metrics_file.history)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perplexity_weights_by_label_count() {
        let mut ppl = Perplexity::default();
        ppl.update(1.0, 3);
        ppl.update(4.0, 1);

        assert!((ppl.value() - (7.0_f64 / 4.0).exp()).abs() < 1e-9);
    }

    #[test]
    fn empty_perplexity_is_nan() {
        assert!(Perplexity::default().value().is_nan());
    }

    #[test]
    fn history_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = Seq2SeqConfig::new(10).with_hidden_size(8);
        let history = vec![EpochMetrics {
            epoch: 1,
            learning_rate: 0.001,
            loss: 3.5,
            perplexity: 33.125,
            stall_count: 0,
            duration_secs: 1.25,
        }];

        assert!(load_history(dir.path()).unwrap().is_empty());
        save_metrics(dir.path(), &config, &history).unwrap();
        assert_eq!(load_history(dir.path()).unwrap(), history);
    }
}
