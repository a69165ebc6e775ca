use crate::batching::{default_buckets, pad_for_inference};
use crate::checkpoint::{load_config, load_model};
use crate::error::{Error, Result};
use crate::model::Seq2SeqLstm;
use crate::vocabulary::Vocabulary;
use burn::backend::ndarray::NdArray;
use burn::backend::wgpu::{Wgpu, WgpuDevice};
use burn::prelude::*;
use burn::tensor::{ElementConversion, Int};
use std::path::Path;

/// 生成結果
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    /// 生成したトークン（`<EOS>` は含まない。`<PAD>`/`<GO>` は含み、`text` には現れない）
    pub tokens: Vec<usize>,
    /// モデルに入力したソース（パディング後・時間反転済み）
    pub source_tokens: Vec<usize>,
    /// `attention[step][source_position]`
    pub attention: Vec<Vec<f32>>,
}

/// 貪欲法で下の句を生成
///
/// 入力は訓練時と同じくバケット境界までパディングして反転する。
/// 生成長はパディング後のソース長 + 1 まで。
pub fn generate<B: Backend>(
    model: &Seq2SeqLstm<B>,
    vocab: &Vocabulary,
    text: &str,
    boundaries: &[usize],
    device: &B::Device,
) -> Result<Reply> {
    let ids = vocab.encode(text)?;
    let mut source_tokens = pad_for_inference(&ids, vocab, boundaries);
    source_tokens.reverse();

    let src_len = source_tokens.len();
    if src_len == 0 {
        return Err(Error::ShapeMismatch {
            what: "入力の長さ",
            expected: 1,
            actual: 0,
        });
    }

    let source = int_tensor::<B>(&source_tokens, device).reshape([src_len, 1]);
    let (encoder_outputs, mut state) = model.encode(source, model.begin_state(1, device))?;
    let keys = model.attention_keys(encoder_outputs.clone());

    let mut token = vocab.go_id();
    let mut tokens = Vec::new();
    let mut attention = Vec::new();

    for _ in 0..=src_len {
        let step = model.decode_step(int_tensor::<B>(&[token], device), state, &encoder_outputs, &keys)?;
        state = step.state;

        attention.push(step.attention.into_data().iter::<f32>().collect());

        let predicted: i64 = step.logits.argmax(1).into_scalar().elem();
        token = predicted as usize;
        if token == vocab.eos_id() {
            break;
        }
        tokens.push(token);
    }

    Ok(Reply {
        text: vocab.decode(&tokens)?,
        tokens,
        source_tokens,
        attention,
    })
}

fn int_tensor<B: Backend>(ids: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let ids: Vec<i32> = ids.iter().map(|&id| id as i32).collect();
    Tensor::<B, 1, Int>::from_data(ids.as_slice(), device)
}

/// 保存済みモデルを指定バックエンドで読み込み、生成する（ジェネリック）
pub fn predict_generic<B: Backend>(
    model_dir: &Path,
    vocab: &Vocabulary,
    text: &str,
    sequence_length: usize,
    device: &B::Device,
) -> Result<Reply> {
    let config = load_config(model_dir)?;
    if config.vocab_size != vocab.size() {
        return Err(Error::ShapeMismatch {
            what: "語彙サイズ",
            expected: vocab.size(),
            actual: config.vocab_size,
        });
    }
    let model = load_model::<B>(model_dir, &config, device)?;

    generate(&model, vocab, text, &default_buckets(sequence_length), device)
}

/// バックエンドを選択して推論実行
pub fn run_inference(
    backend_name: &str,
    model_dir: &Path,
    vocab: &Vocabulary,
    text: &str,
    sequence_length: usize,
) -> Result<Reply> {
    match backend_name {
        "wgpu" => {
            let device = WgpuDevice::default();
            predict_generic::<Wgpu>(model_dir, vocab, text, sequence_length, &device)
        }
        "ndarray" => {
            let device = Default::default();
            predict_generic::<NdArray>(model_dir, vocab, text, sequence_length, &device)
        }
        _ => Err(Error::Config(format!("未対応のバックエンド: {}", backend_name))),
    }
}
