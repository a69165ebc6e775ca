use crate::corpus::Conversation;
use crate::error::Result;
use crate::vocabulary::Vocabulary;
use burn::prelude::*;
use burn::tensor::Int;

/// トークンID化されたペア (source, target)
pub type TokenPair = (Vec<usize>, Vec<usize>);

/// どちらかの句が `max_len` 文字を超えるペアを除外
pub fn filter_by_length(pairs: &[Conversation], max_len: usize) -> Vec<Conversation> {
    pairs
        .iter()
        .filter(|(src, tgt)| src.chars().count() <= max_len && tgt.chars().count() <= max_len)
        .cloned()
        .collect()
}

/// 両方の句をIDの列に変換
pub fn tokenize(pairs: &[Conversation], vocab: &Vocabulary) -> Result<Vec<TokenPair>> {
    pairs
        .iter()
        .map(|(src, tgt)| Ok((vocab.encode(src)?, vocab.encode(tgt)?)))
        .collect()
}

/// 最大長に対する既定のバケット境界: 2, 4, 8, ..., 2^floor(log2(max_len))
pub fn default_buckets(max_len: usize) -> Vec<usize> {
    std::iter::successors(Some(2usize), |&b| b.checked_mul(2))
        .take_while(|&b| b <= max_len)
        .collect()
}

/// バケット境界ごとにペアをまとめる遅延イテレータ
///
/// 境界の昇順に `(バケット内のペア, 境界)` を返す。空のバケットは飛ばし、
/// 最大の境界を超えるペアはどのバケットにも入らない。
#[derive(Debug, Clone)]
pub struct Buckets<'a> {
    pairs: &'a [TokenPair],
    boundaries: &'a [usize],
    next: usize,
}

impl<'a> Iterator for Buckets<'a> {
    type Item = (Vec<&'a TokenPair>, usize);

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.boundaries.len() {
            let index = self.next;
            self.next += 1;

            let max_len = self.boundaries[index];
            let bucket: Vec<&'a TokenPair> = self
                .pairs
                .iter()
                .filter(|(src, _)| bucket_index(src.len(), self.boundaries) == Some(index))
                .collect();

            if !bucket.is_empty() {
                return Some((bucket, max_len));
            }
        }

        None
    }
}

/// ペアをバケットに振り分ける
///
/// `boundaries` は狭義単調増加であること。
pub fn bucket<'a>(pairs: &'a [TokenPair], boundaries: &'a [usize]) -> Buckets<'a> {
    assert!(
        boundaries.windows(2).all(|w| w[0] < w[1]),
        "バケット境界は狭義単調増加である必要があります: {:?}",
        boundaries
    );

    Buckets {
        pairs,
        boundaries,
        next: 0,
    }
}

/// 長さ `len` が属するバケットの添字（直前の境界は含まず、自身の境界は含む）
fn bucket_index(len: usize, boundaries: &[usize]) -> Option<usize> {
    boundaries.iter().position(|&max_len| len <= max_len)
}

/// 1バッチ分のテンソルデータ（時間軸が外側、バッチ軸が内側）
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// パディング後に時間反転したソース `[seq_len, batch_size]`
    pub source: Vec<usize>,
    /// `<GO>` + ターゲット `[seq_len + 1, batch_size]`
    pub decoder_input: Vec<usize>,
    /// ターゲット + `<EOS>` を平坦化したラベル `(seq_len + 1) * batch_size`
    pub label: Vec<usize>,
    pub seq_len: usize,
    pub batch_size: usize,
}

impl Batch {
    /// バッチ内 `index` 番目のソース列（反転済み）
    pub fn source_sequence(&self, index: usize) -> Vec<usize> {
        column(&self.source, self.batch_size, index)
    }

    pub fn decoder_input_sequence(&self, index: usize) -> Vec<usize> {
        column(&self.decoder_input, self.batch_size, index)
    }

    pub fn label_sequence(&self, index: usize) -> Vec<usize> {
        column(&self.label, self.batch_size, index)
    }

    /// `(source [S, B], decoder_input [S+1, B], label [(S+1)*B])` のテンソルに変換
    pub fn to_tensors<B: Backend>(
        &self,
        device: &B::Device,
    ) -> (Tensor<B, 2, Int>, Tensor<B, 2, Int>, Tensor<B, 1, Int>) {
        let source = int_tensor::<B>(&self.source, device).reshape([self.seq_len, self.batch_size]);
        let decoder_input = int_tensor::<B>(&self.decoder_input, device)
            .reshape([self.seq_len + 1, self.batch_size]);
        let label = int_tensor::<B>(&self.label, device);

        (source, decoder_input, label)
    }
}

fn int_tensor<B: Backend>(ids: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let ids: Vec<i32> = ids.iter().map(|&id| id as i32).collect();
    Tensor::<B, 1, Int>::from_data(ids.as_slice(), device)
}

fn column(time_major: &[usize], batch_size: usize, index: usize) -> Vec<usize> {
    time_major
        .iter()
        .skip(index)
        .step_by(batch_size)
        .copied()
        .collect()
}

/// バケット内のペアを `batch_size` 件ずつ入力順にバッチ化する遅延イテレータ
///
/// 最後のバッチは `batch_size` より小さいことがある。シャッフルは呼び出し側の責任。
pub fn make_batches<'a>(
    pairs: &'a [&'a TokenPair],
    vocab: &Vocabulary,
    batch_size: usize,
    seq_len: usize,
) -> impl Iterator<Item = Batch> + 'a {
    assert!(batch_size > 0, "batch_size は1以上である必要があります");

    let pad = vocab.pad_id();
    let go = vocab.go_id();
    let eos = vocab.eos_id();

    pairs.chunks(batch_size).map(move |chunk| {
        let sources: Vec<Vec<usize>> = chunk
            .iter()
            .map(|(src, _)| {
                let mut padded = pad_to(src, seq_len, pad);
                padded.reverse();
                padded
            })
            .collect();

        let decoder_inputs: Vec<Vec<usize>> = chunk
            .iter()
            .map(|(_, tgt)| {
                let mut prefixed = Vec::with_capacity(tgt.len() + 1);
                prefixed.push(go);
                prefixed.extend_from_slice(tgt);
                pad_to(&prefixed, seq_len + 1, pad)
            })
            .collect();

        let labels: Vec<Vec<usize>> = chunk
            .iter()
            .map(|(_, tgt)| {
                let mut suffixed = tgt.clone();
                suffixed.push(eos);
                pad_to(&suffixed, seq_len + 1, pad)
            })
            .collect();

        Batch {
            source: transpose(&sources, seq_len),
            decoder_input: transpose(&decoder_inputs, seq_len + 1),
            label: transpose(&labels, seq_len + 1),
            seq_len,
            batch_size: chunk.len(),
        }
    })
}

/// 指定長まで右側を `<PAD>` で埋める（長すぎる場合は切り詰め）
fn pad_to(tokens: &[usize], len: usize, pad: usize) -> Vec<usize> {
    let mut padded = tokens.to_vec();
    padded.resize(len, pad);
    padded
}

/// バッチ優先の行列を時間優先の平坦な列に並べ替える
fn transpose(rows: &[Vec<usize>], time: usize) -> Vec<usize> {
    let mut flat = Vec::with_capacity(rows.len() * time);
    for t in 0..time {
        for row in rows {
            flat.push(row[t]);
        }
    }
    flat
}

/// 推論用に1文をそれが収まる最小のバケット境界までパディング
///
/// どの境界にも収まらない場合はそのまま返す（切り詰めや拒否は呼び出し側で行う）。
pub fn pad_for_inference(sequence: &[usize], vocab: &Vocabulary, boundaries: &[usize]) -> Vec<usize> {
    match bucket_index(sequence.len(), boundaries) {
        Some(index) => pad_to(sequence, boundaries[index], vocab.pad_id()),
        None => sequence.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocabulary::{EOS_ID, GO_ID, PAD_ID};

    fn conv(src: &str, tgt: &str) -> Conversation {
        (src.to_string(), tgt.to_string())
    }

    fn pair_with_len(len: usize) -> TokenPair {
        (vec![3; len], vec![4; len])
    }

    #[test]
    fn filter_drops_long_pairs_and_is_idempotent() {
        let dataset = vec![conv("ab", "cd"), conv("abcd", "ab"), conv("ab", "abcd"), conv("", "")];

        let filtered = filter_by_length(&dataset, 3);
        assert_eq!(filtered, vec![conv("ab", "cd"), conv("", "")]);
        assert_eq!(filter_by_length(&filtered, 3), filtered);
    }

    #[test]
    fn filter_counts_characters_not_bytes() {
        let dataset = vec![conv("春风得意", "秋月无边")];
        assert_eq!(filter_by_length(&dataset, 4).len(), 1);
    }

    #[test]
    fn default_buckets_are_powers_of_two() {
        assert_eq!(default_buckets(32), vec![2, 4, 8, 16, 32]);
        assert_eq!(default_buckets(20), vec![2, 4, 8, 16]);
        assert!(default_buckets(1).is_empty());
    }

    #[test]
    fn bucket_assigns_minimal_boundary() {
        let pairs: Vec<TokenPair> = [1, 3, 5, 9].iter().map(|&l| pair_with_len(l)).collect();
        let boundaries = [2, 4, 8];

        let buckets: Vec<(Vec<usize>, usize)> = bucket(&pairs, &boundaries)
            .map(|(items, max_len)| (items.iter().map(|(s, _)| s.len()).collect(), max_len))
            .collect();

        assert_eq!(buckets, vec![(vec![1], 2), (vec![3], 4), (vec![5], 8)]);
    }

    #[test]
    fn bucket_boundary_is_inclusive_and_skips_empty() {
        let pairs: Vec<TokenPair> = [4, 0, 16, 4].iter().map(|&l| pair_with_len(l)).collect();
        let boundaries = [2, 4, 8, 16];

        let buckets: Vec<(usize, usize)> = bucket(&pairs, &boundaries)
            .map(|(items, max_len)| (items.len(), max_len))
            .collect();

        assert_eq!(buckets, vec![(1, 2), (2, 4), (1, 16)]);
    }

    #[test]
    fn bucket_preserves_order_and_restarts() {
        let pairs: Vec<TokenPair> = vec![
            (vec![3, 3], vec![5]),
            (vec![3, 3, 3], vec![6]),
            (vec![4], vec![7]),
        ];
        let boundaries = [2, 4];

        let first: Vec<_> = bucket(&pairs, &boundaries).collect();
        let second: Vec<_> = bucket(&pairs, &boundaries).collect();
        assert_eq!(first, second);

        let (small, _) = &first[0];
        assert_eq!(small[0].1, vec![5]);
        assert_eq!(small[1].1, vec![7]);
    }

    #[test]
    #[should_panic]
    fn bucket_rejects_unsorted_boundaries() {
        let pairs: Vec<TokenPair> = Vec::new();
        let _ = bucket(&pairs, &[4, 2]);
    }

    #[test]
    fn make_batches_splits_last_partial_batch() {
        let vocab = Vocabulary::from_chars("abcd".chars());
        let pairs: Vec<TokenPair> = (0..3).map(|_| pair_with_len(2)).collect();
        let refs: Vec<&TokenPair> = pairs.iter().collect();

        let sizes: Vec<usize> = make_batches(&refs, &vocab, 2, 2).map(|b| b.batch_size).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[test]
    fn make_batches_pads_reverses_and_shifts() {
        let vocab = Vocabulary::from_chars("abcd".chars());
        // a=3, b=4, c=5, d=6
        let pairs: Vec<TokenPair> = vec![(vec![3, 4], vec![5, 6]), (vec![5], vec![6])];
        let refs: Vec<&TokenPair> = pairs.iter().collect();

        let batch = make_batches(&refs, &vocab, 4, 4).next().unwrap();

        assert_eq!(batch.batch_size, 2);
        assert_eq!(batch.source_sequence(0), vec![PAD_ID, PAD_ID, 4, 3]);
        assert_eq!(batch.source_sequence(1), vec![PAD_ID, PAD_ID, PAD_ID, 5]);
        assert_eq!(batch.decoder_input_sequence(0), vec![GO_ID, 5, 6, PAD_ID, PAD_ID]);
        assert_eq!(batch.label_sequence(0), vec![5, 6, EOS_ID, PAD_ID, PAD_ID]);
        assert_eq!(batch.label_sequence(1), vec![6, EOS_ID, PAD_ID, PAD_ID, PAD_ID]);

        // 時間優先: 先頭はバッチ内全件の t=0
        assert_eq!(&batch.source[..2], &[PAD_ID, PAD_ID]);
        assert_eq!(&batch.decoder_input[..2], &[GO_ID, GO_ID]);
        assert_eq!(batch.label.len(), 5 * 2);
    }

    #[test]
    fn make_batches_truncates_overlong_targets() {
        let vocab = Vocabulary::from_chars("ab".chars());
        let pairs: Vec<TokenPair> = vec![(vec![3], vec![3, 4, 3, 4])];
        let refs: Vec<&TokenPair> = pairs.iter().collect();

        let batch = make_batches(&refs, &vocab, 1, 2).next().unwrap();
        assert_eq!(batch.decoder_input_sequence(0), vec![GO_ID, 3, 4]);
        assert_eq!(batch.label_sequence(0), vec![3, 4, 3]);
    }

    #[test]
    fn pad_for_inference_uses_smallest_fitting_boundary() {
        let vocab = Vocabulary::from_chars("ab".chars());
        let boundaries = [2, 4, 8];

        assert_eq!(pad_for_inference(&[3, 4, 3], &vocab, &boundaries), vec![3, 4, 3, PAD_ID]);
        assert_eq!(pad_for_inference(&[3, 4], &vocab, &boundaries), vec![3, 4]);
        assert_eq!(pad_for_inference(&[3; 9], &vocab, &boundaries), vec![3; 9]);
    }
}
