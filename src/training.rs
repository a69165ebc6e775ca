use crate::batching::{bucket, default_buckets, filter_by_length, make_batches, tokenize, TokenPair};
use crate::checkpoint::{append_checkpoint, load_checkpoint, load_model, save_model, TrainerState};
use crate::config::{
    BATCH_SIZE, CHECKPOINT_NAME, CORPUS_PATH, DROPOUT, EMBED_SIZE, GRADIENT_CLIP, HIDDEN_SIZE,
    LEARNING_RATE_DECAY, MAX_STALL_EPOCHS, MIN_LEARNING_RATE, MODEL_DIR, NUM_LAYERS,
    SEQUENCE_LENGTH, SGD_MOMENTUM, VOCAB_PATH,
};
use crate::corpus::load_conversations;
use crate::error::{Error, Result};
use crate::metrics::{load_history, save_metrics, EpochMetrics, Perplexity};
use crate::model::{Seq2SeqConfig, Seq2SeqLstm};
use crate::vocabulary::Vocabulary;
use burn::grad_clipping::GradientClippingConfig;
use burn::nn::loss::CrossEntropyLoss;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::PathBuf;
use std::time::Instant;

/// 訓練の設定（パスとハイパーパラメータ）
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub corpus_path: PathBuf,
    pub vocab_path: PathBuf,
    pub model_dir: PathBuf,
    pub embed_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dropout: f64,
    pub batch_size: usize,
    pub sequence_length: usize,
    /// Adamの代わりにモーメンタム付きSGDを使う
    pub use_sgd: bool,
    /// シャッフル用の乱数シード（未指定ならエントロピーから）
    pub seed: Option<u64>,
    /// 学習率の下限に達する前でも、このエポックに到達したら終了
    pub max_epochs: Option<usize>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            corpus_path: PathBuf::from(CORPUS_PATH),
            vocab_path: PathBuf::from(VOCAB_PATH),
            model_dir: PathBuf::from(MODEL_DIR),
            embed_size: EMBED_SIZE,
            hidden_size: HIDDEN_SIZE,
            num_layers: NUM_LAYERS,
            dropout: DROPOUT,
            batch_size: BATCH_SIZE,
            sequence_length: SEQUENCE_LENGTH,
            use_sgd: false,
            seed: None,
            max_epochs: None,
        }
    }
}

impl TrainingConfig {
    pub fn model_config(&self, vocab_size: usize) -> Seq2SeqConfig {
        Seq2SeqConfig::new(vocab_size)
            .with_embed_size(self.embed_size)
            .with_hidden_size(self.hidden_size)
            .with_num_layers(self.num_layers)
            .with_dropout(self.dropout)
    }
}

/// エポック終了時の学習率スケジュールの判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochOutcome {
    /// 最良損失を更新（パラメータと記録を保存する）
    Improved,
    /// 改善なし、停滞カウントを加算
    Stalled,
    /// 停滞が続いたので学習率を半減
    Decayed,
}

/// エポック平均損失から次の訓練状態を決める
pub fn end_epoch(state: TrainerState, avg_loss: f64) -> (TrainerState, EpochOutcome) {
    let mut next = state;

    let outcome = if avg_loss < state.best_loss {
        next.best_loss = avg_loss;
        next.stall_count = 0;
        EpochOutcome::Improved
    } else if state.stall_count < MAX_STALL_EPOCHS {
        next.stall_count += 1;
        EpochOutcome::Stalled
    } else {
        next.stall_count = 0;
        next.learning_rate *= LEARNING_RATE_DECAY;
        EpochOutcome::Decayed
    };

    (next, outcome)
}

/// コーパス読み込み → 長さフィルタ → 語彙構築・保存 → ID化
pub fn prepare_dataset(config: &TrainingConfig) -> Result<(Vocabulary, Vec<TokenPair>)> {
    log::info!("データセットを読み込み中...");
    let conversations = load_conversations(&config.corpus_path)?;
    let conversations = filter_by_length(&conversations, config.sequence_length);
    log::info!("フィルタ後のデータセットサイズ: {}", conversations.len());

    let vocab = Vocabulary::build(&conversations);
    vocab.save(&config.vocab_path)?;

    let dataset = tokenize(&conversations, &vocab)?;
    Ok((vocab, dataset))
}

/// エポックごとのシャッフルに使う乱数生成器（シード未指定ならエントロピーから）
///
/// NaN 再開をまたいで同じ生成器を使い続けるため、[`run_with_recovery`] の外で作る。
pub fn shuffle_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// 訓練を1回実行（チェックポイントがあれば再開）
///
/// 損失が NaN になった場合は `Error::DivergedLoss` を返す。
/// 呼び出し側は [`run_with_recovery`] で再起動する。
pub fn train<B: AutodiffBackend>(
    config: &TrainingConfig,
    device: &B::Device,
    rng: &mut StdRng,
) -> Result<TrainerState> {
    let (vocab, dataset) = prepare_dataset(config)?;
    if dataset.is_empty() {
        return Err(Error::EmptyDataset);
    }

    let model_config = config.model_config(vocab.size());
    let checkpoint_path = config.model_dir.join(CHECKPOINT_NAME);

    let (model, state) = match load_checkpoint(&checkpoint_path)? {
        Some(state) => {
            log::info!("チェックポイントから再開: {}", state.to_line());
            (load_model::<B>(&config.model_dir, &model_config, device)?, state)
        }
        None => (model_config.init::<B>(device), TrainerState::default()),
    };

    log::info!("学習率: {}", state.learning_rate);

    let clipping = GradientClippingConfig::Value(GRADIENT_CLIP);
    if config.use_sgd {
        log::info!("オプティマイザ: SGD");
        let optimizer = SgdConfig::new()
            .with_momentum(Some(
                MomentumConfig::new()
                    .with_momentum(SGD_MOMENTUM)
                    .with_dampening(0.0),
            ))
            .with_gradient_clipping(Some(clipping))
            .init::<B, Seq2SeqLstm<B>>();
        run_epochs(model, optimizer, state, dataset, &vocab, config, &model_config, device, rng)
    } else {
        log::info!("オプティマイザ: Adam");
        let optimizer = AdamConfig::new()
            .with_grad_clipping(Some(clipping))
            .init::<B, Seq2SeqLstm<B>>();
        run_epochs(model, optimizer, state, dataset, &vocab, config, &model_config, device, rng)
    }
}

#[allow(clippy::too_many_arguments)]
fn run_epochs<B, O>(
    mut model: Seq2SeqLstm<B>,
    mut optimizer: O,
    mut state: TrainerState,
    mut dataset: Vec<TokenPair>,
    vocab: &Vocabulary,
    config: &TrainingConfig,
    model_config: &Seq2SeqConfig,
    device: &B::Device,
    rng: &mut StdRng,
) -> Result<TrainerState>
where
    B: AutodiffBackend,
    O: Optimizer<Seq2SeqLstm<B>, B>,
{
    let boundaries = default_buckets(config.sequence_length);
    let checkpoint_path = config.model_dir.join(CHECKPOINT_NAME);
    // チェックポイント以降のエポック（停滞・NaN再開で失われた分）は捨てる
    let mut history = load_history(&config.model_dir)?;
    history.retain(|metrics| metrics.epoch <= state.epoch);

    log::info!("訓練開始...");

    while state.learning_rate >= MIN_LEARNING_RATE {
        if config.max_epochs.is_some_and(|max| state.epoch >= max) {
            log::info!("最大エポック数 {} に到達", state.epoch);
            break;
        }

        dataset.shuffle(rng);

        let (trained, metrics) = train_epoch(
            model,
            &mut optimizer,
            &state,
            &dataset,
            vocab,
            &boundaries,
            config.batch_size,
            device,
        )?;
        model = trained;
        state.epoch += 1;

        log::info!(
            "[Epoch {}]  learning_rate {:.10}  loss {:.10}  perplexity {:.6}  epochs_no_progress {}  duration {:.2}s",
            state.epoch,
            state.learning_rate,
            metrics.loss,
            metrics.perplexity,
            state.stall_count,
            metrics.duration_secs
        );

        let (next, outcome) = end_epoch(state, metrics.loss);
        state = next;

        match outcome {
            EpochOutcome::Improved => {
                save_model(&model, model_config, &config.model_dir)?;
                append_checkpoint(&checkpoint_path, &state)?;
            }
            EpochOutcome::Stalled => {}
            EpochOutcome::Decayed => {
                log::info!("学習率を減衰: {:.10}", state.learning_rate);
            }
        }

        history.push(metrics);
        save_metrics(&config.model_dir, model_config, &history)?;
    }

    Ok(state)
}

/// 1エポック分の訓練
///
/// バケットは境界の昇順、バケット内のバッチはパイプラインの順に処理する。
#[allow(clippy::too_many_arguments)]
fn train_epoch<B, O>(
    mut model: Seq2SeqLstm<B>,
    optimizer: &mut O,
    state: &TrainerState,
    dataset: &[TokenPair],
    vocab: &Vocabulary,
    boundaries: &[usize],
    batch_size: usize,
    device: &B::Device,
) -> Result<(Seq2SeqLstm<B>, EpochMetrics)>
where
    B: AutodiffBackend,
    O: Optimizer<Seq2SeqLstm<B>, B>,
{
    let started = Instant::now();
    let loss_fn = CrossEntropyLoss::new(None, device);

    let mut total_loss = 0.0;
    let mut batch_count = 0;
    let mut perplexity = Perplexity::default();

    for (bucket_pairs, seq_len) in bucket(dataset, boundaries) {
        for batch in make_batches(&bucket_pairs, vocab, batch_size, seq_len) {
            batch_count += 1;

            let (source, target, label) = batch.to_tensors::<B>(device);
            let hidden = model.begin_state(batch.batch_size, device);

            // フォワードパス
            let (logits, _) = model.forward(source, target, hidden)?;

            // 損失計算（全位置、無視するラベルなし）
            let loss = loss_fn.forward(logits, label);
            let batch_loss: f64 = loss.clone().into_scalar().elem();
            if batch_loss.is_nan() {
                return Err(Error::DivergedLoss {
                    epoch: state.epoch,
                    batch: batch_count,
                });
            }

            // バックプロパゲーションとパラメータ更新
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(state.learning_rate, model, grads);

            total_loss += batch_loss;
            perplexity.update(batch_loss, batch.label.len());

            log::info!(
                "[Epoch {}  Bucket {}  Batch {}]  batch_loss {:.10}  average_loss {:.10}  elapsed {:.2}s",
                state.epoch,
                seq_len,
                batch_count,
                batch_loss,
                total_loss / batch_count as f64,
                started.elapsed().as_secs_f64()
            );
        }
    }

    if batch_count == 0 {
        return Err(Error::EmptyDataset);
    }

    let metrics = EpochMetrics {
        epoch: state.epoch + 1,
        learning_rate: state.learning_rate,
        loss: total_loss / batch_count as f64,
        perplexity: perplexity.value(),
        stall_count: state.stall_count,
        duration_secs: started.elapsed().as_secs_f64(),
    };

    Ok((model, metrics))
}

/// 損失が NaN になったら最後のチェックポイントから訓練全体をやり直す
///
/// NaN 以外のエラーはそのまま返す。
pub fn run_with_recovery<T, F>(mut attempt: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    loop {
        match attempt() {
            Err(Error::DivergedLoss { epoch, batch }) => {
                log::warn!(
                    "Oops! 損失が NaN になりました (epoch {}, batch {})。チェックポイントから再開します",
                    epoch,
                    batch
                );
            }
            result => return result,
        }
    }
}
