use crate::config::{DROPOUT, EMBED_SIZE, HIDDEN_SIZE, NUM_LAYERS};
use crate::error::Error;
use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, Initializer, Linear, LinearConfig, Lstm,
    LstmConfig, LstmState,
};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use burn::tensor::Int;

// ===== 設定 =====

/// Seq2Seqモデルの形状設定
#[derive(Config, Debug)]
pub struct Seq2SeqConfig {
    pub vocab_size: usize,
    #[config(default = "EMBED_SIZE")]
    pub embed_size: usize,
    #[config(default = "HIDDEN_SIZE")]
    pub hidden_size: usize,
    #[config(default = "NUM_LAYERS")]
    pub num_layers: usize,
    #[config(default = "DROPOUT")]
    pub dropout: f64,
}

impl Seq2SeqConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Seq2SeqLstm<B> {
        // 埋め込みだけは一様分布 [-0.1, 0.1] で初期化
        let embedding = EmbeddingConfig::new(self.vocab_size, self.embed_size)
            .with_initializer(Initializer::Uniform {
                min: -0.1,
                max: 0.1,
            })
            .init(device);

        let encoder = StackedLstm::new(self.embed_size, self.hidden_size, self.num_layers, device);
        // デコーダー入力は [埋め込み ; コンテキスト]
        let decoder = StackedLstm::new(
            self.embed_size + self.hidden_size,
            self.hidden_size,
            self.num_layers,
            device,
        );

        let attention = Attention::new(self.hidden_size, device);
        let dropout = DropoutConfig::new(self.dropout).init();
        let output = LinearConfig::new(self.hidden_size, self.vocab_size)
            .with_initializer(Initializer::XavierUniform { gain: 1.0 })
            .init(device);

        Seq2SeqLstm {
            embedding,
            encoder,
            attention,
            decoder,
            dropout,
            output,
        }
    }
}

// ===== 隠れ状態 =====

/// 多層LSTMの隠れ状態
///
/// `hidden`, `cell` とも `[num_layers, batch_size, hidden_size]`。
#[derive(Debug, Clone)]
pub struct RecurrentState<B: Backend> {
    pub hidden: Tensor<B, 3>,
    pub cell: Tensor<B, 3>,
}

impl<B: Backend> RecurrentState<B> {
    pub fn zeros(
        num_layers: usize,
        batch_size: usize,
        hidden_size: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            hidden: Tensor::zeros([num_layers, batch_size, hidden_size], device),
            cell: Tensor::zeros([num_layers, batch_size, hidden_size], device),
        }
    }

    pub fn num_layers(&self) -> usize {
        self.hidden.dims()[0]
    }

    pub fn batch_size(&self) -> usize {
        self.hidden.dims()[1]
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden.dims()[2]
    }

    /// 最上位レイヤーの隠れ状態 `[batch_size, hidden_size]`
    pub fn top_hidden(&self) -> Tensor<B, 2> {
        layer_slice(&self.hidden, self.num_layers() - 1)
    }

    fn layer(&self, index: usize) -> LstmState<B, 2> {
        LstmState {
            cell: layer_slice(&self.cell, index),
            hidden: layer_slice(&self.hidden, index),
        }
    }
}

fn layer_slice<B: Backend>(tensor: &Tensor<B, 3>, index: usize) -> Tensor<B, 2> {
    let [_, batch_size, hidden_size] = tensor.dims();
    tensor
        .clone()
        .slice([index..index + 1, 0..batch_size, 0..hidden_size])
        .reshape([batch_size, hidden_size])
}

// ===== 多層LSTM =====

/// LSTMを積み重ねたもの。状態は明示的に受け取り、更新後の状態を返す。
#[derive(Module, Debug)]
pub struct StackedLstm<B: Backend> {
    layers: Vec<Lstm<B>>,
}

impl<B: Backend> StackedLstm<B> {
    pub fn new(
        input_size: usize,
        hidden_size: usize,
        num_layers: usize,
        device: &B::Device,
    ) -> Self {
        let layers = (0..num_layers)
            .map(|i| {
                let d_input = if i == 0 { input_size } else { hidden_size };
                LstmConfig::new(d_input, hidden_size, true).init(device)
            })
            .collect();

        Self { layers }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// input: `[batch_size, seq_len, input_size]` → `[batch_size, seq_len, hidden_size]`
    pub fn forward(
        &self,
        input: Tensor<B, 3>,
        state: RecurrentState<B>,
    ) -> (Tensor<B, 3>, RecurrentState<B>) {
        let mut x = input;
        let mut hiddens = Vec::with_capacity(self.layers.len());
        let mut cells = Vec::with_capacity(self.layers.len());

        for (index, lstm) in self.layers.iter().enumerate() {
            let (output, next) = lstm.forward(x, Some(state.layer(index)));
            x = output;
            hiddens.push(next.hidden);
            cells.push(next.cell);
        }

        let state = RecurrentState {
            hidden: Tensor::stack(hiddens, 0),
            cell: Tensor::stack(cells, 0),
        };

        (x, state)
    }

    /// 1タイムステップ分: `step(input_t, hidden) -> (output_t, hidden')`
    pub fn step(
        &self,
        input: Tensor<B, 2>,
        state: RecurrentState<B>,
    ) -> (Tensor<B, 2>, RecurrentState<B>) {
        let (output, state) = self.forward(input.unsqueeze_dim(1), state);
        let [batch_size, _, hidden_size] = output.dims();

        (output.reshape([batch_size, hidden_size]), state)
    }
}

// ===== Attention =====

/// 内積Attention
///
/// エンコーダー出力への線形写像（キー）はバッチごとに1回だけ計算し、
/// 各デコードステップで使い回す。
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    projection: Linear<B>,
}

impl<B: Backend> Attention<B> {
    pub fn new(hidden_size: usize, device: &B::Device) -> Self {
        let projection = LinearConfig::new(hidden_size, hidden_size)
            .with_bias(false)
            .with_initializer(Initializer::XavierUniform { gain: 1.0 })
            .init(device);

        Self { projection }
    }

    /// encoder_outputs: `[src_len, batch_size, hidden_size]` → 同形状のキー
    pub fn keys(&self, encoder_outputs: Tensor<B, 3>) -> Tensor<B, 3> {
        self.projection.forward(encoder_outputs)
    }

    /// ソース各位置への重み `[src_len, batch_size, 1]`（ソース時間軸で和が1）
    ///
    /// query: 最上位レイヤーの隠れ状態 `[batch_size, hidden_size]`
    pub fn weights(&self, keys: Tensor<B, 3>, query: Tensor<B, 2>) -> Tensor<B, 3> {
        // クエリを全ソース位置にブロードキャストして内積
        let scores = (keys * query.unsqueeze_dim::<3>(0)).sum_dim(2);

        // burn の softmax は最大値を引いてから exp を取る
        softmax(scores, 0)
    }

    /// 重み付き和によるコンテキストベクトル `[batch_size, hidden_size]`
    pub fn context(encoder_outputs: Tensor<B, 3>, weights: Tensor<B, 3>) -> Tensor<B, 2> {
        let [_, batch_size, hidden_size] = encoder_outputs.dims();

        (encoder_outputs * weights)
            .sum_dim(0)
            .reshape([batch_size, hidden_size])
    }
}

// ===== Seq2Seq =====

/// 1デコードステップの結果
#[derive(Debug, Clone)]
pub struct DecodeStep<B: Backend> {
    /// `[batch_size, vocab_size]`
    pub logits: Tensor<B, 2>,
    pub state: RecurrentState<B>,
    /// `[src_len, batch_size]`
    pub attention: Tensor<B, 2>,
}

/// Attention付きLSTM Seq2Seqモデル
///
/// 入出力テンソルはすべて時間優先 (`[time, batch, ...]`)。
#[derive(Module, Debug)]
pub struct Seq2SeqLstm<B: Backend> {
    embedding: Embedding<B>,
    encoder: StackedLstm<B>,
    attention: Attention<B>,
    decoder: StackedLstm<B>,
    dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> Seq2SeqLstm<B> {
    pub fn vocab_size(&self) -> usize {
        self.embedding.weight.val().dims()[0]
    }

    pub fn embed_size(&self) -> usize {
        self.embedding.weight.val().dims()[1]
    }

    pub fn hidden_size(&self) -> usize {
        self.attention.projection.weight.val().dims()[0]
    }

    pub fn num_layers(&self) -> usize {
        self.encoder.num_layers()
    }

    /// ゼロ初期化した隠れ状態
    pub fn begin_state(&self, batch_size: usize, device: &B::Device) -> RecurrentState<B> {
        RecurrentState::zeros(self.num_layers(), batch_size, self.hidden_size(), device)
    }

    /// 訓練時のフォワードパス（Teacher Forcing）
    ///
    /// 戻り値のロジットは `[target_len * batch_size, vocab_size]`。
    pub fn forward(
        &self,
        source: Tensor<B, 2, Int>,
        target: Tensor<B, 2, Int>,
        state: RecurrentState<B>,
    ) -> crate::error::Result<(Tensor<B, 2>, RecurrentState<B>)> {
        let [_, source_batch] = source.dims();
        let [_, target_batch] = target.dims();
        ensure_eq("ソースとターゲットのバッチサイズ", source_batch, target_batch)?;

        let (encoder_outputs, state) = self.encode(source, state)?;
        self.decode(target, state, encoder_outputs)
    }

    /// source: 反転済みソース `[src_len, batch_size]`
    ///
    /// 戻り値: エンコーダー出力 `[src_len, batch_size, hidden_size]` と最終状態
    pub fn encode(
        &self,
        source: Tensor<B, 2, Int>,
        state: RecurrentState<B>,
    ) -> crate::error::Result<(Tensor<B, 3>, RecurrentState<B>)> {
        let [_, batch_size] = source.dims();
        self.check_state(&state, batch_size)?;

        let embedded = self.embedding.forward(source);
        // LSTMはバッチ優先なので入れ替えてから戻す
        let (outputs, state) = self.encoder.forward(embedded.swap_dims(0, 1), state);

        Ok((outputs.swap_dims(0, 1), state))
    }

    /// target: `<GO>` で始まるデコーダー入力 `[target_len, batch_size]`
    pub fn decode(
        &self,
        target: Tensor<B, 2, Int>,
        state: RecurrentState<B>,
        encoder_outputs: Tensor<B, 3>,
    ) -> crate::error::Result<(Tensor<B, 2>, RecurrentState<B>)> {
        let [target_len, batch_size] = target.dims();
        if target_len == 0 {
            return Err(Error::ShapeMismatch {
                what: "デコーダー入力の長さ",
                expected: 1,
                actual: 0,
            });
        }
        self.check_encoder_outputs(&encoder_outputs, batch_size)?;
        self.check_state(&state, batch_size)?;

        let embed_size = self.embed_size();
        let embedded = self.embedding.forward(target);
        let keys = self.attention.keys(encoder_outputs.clone());

        let mut state = state;
        let mut outputs = Vec::with_capacity(target_len);

        // 隠れ状態に依存するため時間方向は逐次処理
        for t in 0..target_len {
            let input = embedded
                .clone()
                .slice([t..t + 1, 0..batch_size, 0..embed_size])
                .reshape([batch_size, embed_size]);

            let step = self.step(input, state, &encoder_outputs, &keys);
            outputs.push(step.logits);
            state = step.state;
        }

        Ok((Tensor::cat(outputs, 0), state))
    }

    /// Attentionキーの事前計算（推論で `decode_step` を繰り返す場合に使う）
    pub fn attention_keys(&self, encoder_outputs: Tensor<B, 3>) -> Tensor<B, 3> {
        self.attention.keys(encoder_outputs)
    }

    /// トークン1つ分のデコード（推論用）
    ///
    /// tokens: `[batch_size]`
    pub fn decode_step(
        &self,
        tokens: Tensor<B, 1, Int>,
        state: RecurrentState<B>,
        encoder_outputs: &Tensor<B, 3>,
        keys: &Tensor<B, 3>,
    ) -> crate::error::Result<DecodeStep<B>> {
        let [batch_size] = tokens.dims();
        self.check_encoder_outputs(encoder_outputs, batch_size)?;
        self.check_state(&state, batch_size)?;

        let input = self
            .embedding
            .forward(tokens.unsqueeze_dim(1))
            .reshape([batch_size, self.embed_size()]);

        Ok(self.step(input, state, encoder_outputs, keys))
    }

    fn step(
        &self,
        input: Tensor<B, 2>,
        state: RecurrentState<B>,
        encoder_outputs: &Tensor<B, 3>,
        keys: &Tensor<B, 3>,
    ) -> DecodeStep<B> {
        let weights = self.attention.weights(keys.clone(), state.top_hidden());
        let context = Attention::context(encoder_outputs.clone(), weights.clone());

        let (output, state) = self.decoder.step(Tensor::cat(vec![input, context], 1), state);

        // ドロップアウトは自動微分バックエンドでのみ有効
        let output = self.dropout.forward(output);
        let logits = self.output.forward(output);

        let [src_len, batch_size, _] = weights.dims();
        DecodeStep {
            logits,
            state,
            attention: weights.reshape([src_len, batch_size]),
        }
    }

    /// 設定とパラメータ形状の一致を確認
    pub fn check_config(&self, config: &Seq2SeqConfig) -> crate::error::Result<()> {
        ensure_eq("語彙サイズ", config.vocab_size, self.vocab_size())?;
        ensure_eq("埋め込み次元", config.embed_size, self.embed_size())?;
        ensure_eq("隠れ状態の次元", config.hidden_size, self.hidden_size())?;
        ensure_eq("レイヤー数", config.num_layers, self.num_layers())?;
        ensure_eq("出力射影の次元", config.vocab_size, self.output.weight.val().dims()[1])
    }

    fn check_state(
        &self,
        state: &RecurrentState<B>,
        batch_size: usize,
    ) -> crate::error::Result<()> {
        ensure_eq("隠れ状態のレイヤー数", self.num_layers(), state.num_layers())?;
        ensure_eq("隠れ状態の次元", self.hidden_size(), state.hidden_size())?;
        ensure_eq("隠れ状態のバッチサイズ", batch_size, state.batch_size())
    }

    fn check_encoder_outputs(
        &self,
        encoder_outputs: &Tensor<B, 3>,
        batch_size: usize,
    ) -> crate::error::Result<()> {
        let [_, encoder_batch, encoder_hidden] = encoder_outputs.dims();
        ensure_eq("エンコーダー出力のバッチサイズ", batch_size, encoder_batch)?;
        ensure_eq("エンコーダー出力の次元", self.hidden_size(), encoder_hidden)
    }
}

fn ensure_eq(what: &'static str, expected: usize, actual: usize) -> crate::error::Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::ShapeMismatch {
            what,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::{NdArray, NdArrayDevice};
    use burn::module::Param;

    type TestBackend = NdArray;

    /// 形状と平坦化した位置だけで決まる固定値（[-1.0, 1.0] の範囲）
    fn pattern<const D: usize>(
        shape: [usize; D],
        device: &NdArrayDevice,
    ) -> Tensor<TestBackend, D> {
        let len: usize = shape.iter().product();
        let values: Vec<f32> = (0..len)
            .map(|j| ((j * 7 + 3) % 11) as f32 * 0.2 - 1.0)
            .collect();
        Tensor::<TestBackend, 1>::from_floats(values.as_slice(), device).reshape(shape)
    }

    fn fill_linear(linear: &mut Linear<TestBackend>, device: &NdArrayDevice) {
        let weight_dims = linear.weight.val().dims();
        let bias_dims = linear.bias.as_ref().map(|bias| bias.val().dims());

        linear.weight = Param::from_tensor(pattern(weight_dims, device));
        linear.bias = bias_dims.map(|dims| Param::from_tensor(pattern(dims, device)));
    }

    fn fill_lstm(lstm: &mut Lstm<TestBackend>, device: &NdArrayDevice) {
        for gate in [
            &mut lstm.input_gate,
            &mut lstm.forget_gate,
            &mut lstm.output_gate,
            &mut lstm.cell_gate,
        ] {
            fill_linear(&mut gate.input_transform, device);
            fill_linear(&mut gate.hidden_transform, device);
        }
    }

    /// 全パラメータを固定値にしたモデル
    fn fixed_model(device: &NdArrayDevice) -> Seq2SeqLstm<TestBackend> {
        let config = Seq2SeqConfig::new(6)
            .with_embed_size(3)
            .with_hidden_size(4)
            .with_num_layers(2);
        let mut model = config.init::<TestBackend>(device);

        let embedding_dims = model.embedding.weight.val().dims();
        model.embedding.weight = Param::from_tensor(pattern(embedding_dims, device));
        for lstm in model
            .encoder
            .layers
            .iter_mut()
            .chain(model.decoder.layers.iter_mut())
        {
            fill_lstm(lstm, device);
        }
        fill_linear(&mut model.attention.projection, device);
        fill_linear(&mut model.output, device);

        model
    }

    #[test]
    fn forward_matches_reference_logits() {
        let device = NdArrayDevice::default();
        let model = fixed_model(&device);

        // 時間優先 [3, 2]: バッチ0 = [0, 3, 4], バッチ1 = [5, 4, 3]
        let source =
            Tensor::<TestBackend, 1, Int>::from_data([0, 5, 3, 4, 4, 3].as_slice(), &device)
                .reshape([3, 2]);
        // バッチ0 = [GO, 3, EOS], バッチ1 = [GO, 5, 4]
        let target =
            Tensor::<TestBackend, 1, Int>::from_data([1, 1, 3, 5, 2, 4].as_slice(), &device)
                .reshape([3, 2]);

        let (logits, _) = model
            .forward(source, target, model.begin_state(2, &device))
            .unwrap();
        assert_eq!(logits.dims(), [6, 6]);

        #[rustfmt::skip]
        let expected: [f32; 36] = [
            -1.338098, 1.686365, 0.183585, -1.713793, 1.310670, -0.388526,
            -1.348538, 1.703492, 0.190629, -1.726754, 1.325276, -0.398667,
            -1.353437, 1.720661, 0.196951, -1.734364, 1.339733, -0.404502,
            -1.364616, 1.829266, 0.211729, -1.769001, 1.424881, -0.402288,
            -1.356964, 1.714566, 0.195382, -1.736760, 1.334770, -0.404720,
            -1.382141, 1.854471, 0.214110, -1.792231, 1.444381, -0.398928,
        ];

        let actual: Vec<f32> = logits.into_data().iter::<f32>().collect();
        for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < 1e-4, "logits[{}] = {}, 期待値 {}", index, a, e);
        }
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Seq2SeqConfig::new(42).with_hidden_size(16);

        let json = serde_json::to_string(&config).unwrap();
        let restored: Seq2SeqConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.vocab_size, 42);
        assert_eq!(restored.hidden_size, 16);
        assert_eq!(restored.embed_size, EMBED_SIZE);
        assert_eq!(restored.dropout, DROPOUT);
    }
}
