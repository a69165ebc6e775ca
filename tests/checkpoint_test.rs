use burn::backend::ndarray::{NdArray, NdArrayDevice};
use burn::prelude::*;
use burn::tensor::Int;
use tempfile::TempDir;

use coupletbot::checkpoint::{load_config, load_model, params_exist, save_model};
use coupletbot::error::Error;
use coupletbot::model::{Seq2SeqConfig, Seq2SeqLstm};

type B = NdArray;

fn tiny_config() -> Seq2SeqConfig {
    Seq2SeqConfig::new(8)
        .with_embed_size(4)
        .with_hidden_size(6)
        .with_num_layers(2)
}

/// 固定入力でのロジット（推論バックエンドなのでドロップアウトは無効）
fn logits_for(model: &Seq2SeqLstm<B>, device: &NdArrayDevice) -> Tensor<B, 2> {
    let source = Tensor::<B, 1, Int>::from_data([0, 3, 4, 5, 6, 7].as_slice(), device)
        .reshape([3, 2]);
    let target = Tensor::<B, 1, Int>::from_data([1, 1, 5, 3, 2, 2].as_slice(), device)
        .reshape([3, 2]);

    let (logits, _) = model
        .forward(source, target, model.begin_state(2, device))
        .unwrap();
    logits
}

/// テンソル間の近似一致を検証
fn assert_tensors_close(a: Tensor<B, 2>, b: Tensor<B, 2>, tolerance: f32) {
    assert_eq!(a.dims(), b.dims());
    let max_diff = (a - b)
        .abs()
        .into_data()
        .iter::<f32>()
        .fold(0.0_f32, f32::max);
    assert!(max_diff < tolerance, "最大誤差: {}", max_diff);
}

#[test]
fn test_save_and_load_reproduces_outputs() {
    let test_dir = TempDir::new().unwrap();
    let device = NdArrayDevice::default();
    let config = tiny_config();

    let model = config.init::<B>(&device);
    let before = logits_for(&model, &device);

    save_model(&model, &config, test_dir.path()).unwrap();
    assert!(params_exist(test_dir.path()));
    let stored = load_config(test_dir.path()).unwrap();
    assert_eq!(stored.vocab_size, config.vocab_size);
    assert_eq!(stored.hidden_size, config.hidden_size);
    assert_eq!(stored.num_layers, config.num_layers);

    let loaded = load_model::<B>(test_dir.path(), &config, &device).unwrap();
    let after = logits_for(&loaded, &device);

    assert_tensors_close(before, after, 1e-6);
}

#[test]
fn test_load_rejects_mismatched_config() {
    let test_dir = TempDir::new().unwrap();
    let device = NdArrayDevice::default();
    let config = tiny_config();

    let model = config.init::<B>(&device);
    save_model(&model, &config, test_dir.path()).unwrap();

    let wider = config.clone().with_hidden_size(12);
    let result = load_model::<B>(test_dir.path(), &wider, &device);

    assert!(matches!(
        result,
        Err(Error::ShapeMismatch {
            expected: 12,
            actual: 6,
            ..
        })
    ));
}

#[test]
fn test_missing_params_are_reported() {
    let test_dir = TempDir::new().unwrap();
    let device = NdArrayDevice::default();

    assert!(!params_exist(test_dir.path()));
    assert!(load_model::<B>(test_dir.path(), &tiny_config(), &device).is_err());
}
