use crate::error::Result;
use crate::inference::Reply;
use crate::vocabulary::{Token, Vocabulary};
use std::fs;
use std::path::{Path, PathBuf};

/// 生成時のAttention行列をCSVファイルにエクスポート
///
/// 行: 生成ステップ（出力した文字）、列: モデルに入力したソース位置（反転済み）
pub fn export_attention_to_csv(
    reply: &Reply,
    vocab: &Vocabulary,
    save_dir: &Path,
    name: &str,
) -> Result<PathBuf> {
    let exports_dir = save_dir.join("exports");
    fs::create_dir_all(&exports_dir)?;

    let mut csv_content = String::new();

    // ヘッダー行（ソースのトークン）
    csv_content.push_str("step\\source");
    for &id in &reply.source_tokens {
        csv_content.push(',');
        csv_content.push_str(&quote(&token_label(vocab, id)?));
    }
    csv_content.push('\n');

    // データ行（最後のステップは <EOS> を出力したステップ）
    for (step, weights) in reply.attention.iter().enumerate() {
        let label = match reply.tokens.get(step) {
            Some(&id) => token_label(vocab, id)?,
            None => "<EOS>".to_string(),
        };
        csv_content.push_str(&quote(&label));
        for value in weights {
            csv_content.push_str(&format!(",{:.6}", value));
        }
        csv_content.push('\n');
    }

    let filepath = exports_dir.join(format!("{}.csv", name));
    fs::write(&filepath, csv_content)?;
    log::info!("Attention行列を出力: {}", filepath.display());

    Ok(filepath)
}

fn token_label(vocab: &Vocabulary, id: usize) -> Result<String> {
    Ok(match vocab.id_to_token(id)? {
        Token::Pad => "<PAD>".to_string(),
        Token::Go => "<GO>".to_string(),
        Token::Eos => "<EOS>".to_string(),
        Token::Char(c) => c.to_string(),
    })
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocabulary::PAD_ID;

    #[test]
    fn writes_one_row_per_step() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = Vocabulary::from_chars("ab,".chars());
        let comma = vocab.char_to_id(',').unwrap();
        let a = vocab.char_to_id('a').unwrap();
        let reply = Reply {
            text: "a".to_string(),
            tokens: vec![a],
            source_tokens: vec![PAD_ID, comma],
            attention: vec![vec![0.25, 0.75], vec![0.5, 0.5]],
        };

        let path = export_attention_to_csv(&reply, &vocab, dir.path(), "attention").unwrap();
        let content = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines[0], "step\\source,\"<PAD>\",\",\"");
        assert_eq!(lines[1], "\"a\",0.250000,0.750000");
        assert_eq!(lines[2], "\"<EOS>\",0.500000,0.500000");
        assert_eq!(lines.len(), 3);
    }
}
