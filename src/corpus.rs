use crate::error::Result;
use std::fs;
use std::path::Path;

/// 上の句と下の句のペア（生の文字列）
pub type Conversation = (String, String);

/// レコード区切り行
const RECORD_DELIMITER: &str = "E\n";
/// 各行の先頭にある話者プレフィックス（例: "M "）の文字数
const LINE_PREFIX_CHARS: usize = 2;

/// 会話コーパスを読み込む
///
/// 形式: `E` 行で区切られたレコード。各レコードの先頭2行から
/// プレフィックス2文字を除いたものを (source, target) とする。
pub fn load_conversations<P: AsRef<Path>>(path: P) -> Result<Vec<Conversation>> {
    let raw = fs::read_to_string(path.as_ref())?;
    let dataset = parse_conversations(&raw);

    log::info!(
        "コーパスを読み込み: {} ({}ペア)",
        path.as_ref().display(),
        dataset.len()
    );

    Ok(dataset)
}

/// コーパス文字列をペアの列に変換
///
/// 最初の区切りより前の内容は捨てる。2行に満たないレコードはスキップ。
pub fn parse_conversations(raw: &str) -> Vec<Conversation> {
    let mut dataset = Vec::new();

    for record in raw.split(RECORD_DELIMITER).skip(1) {
        let lines: Vec<&str> = record.split('\n').collect();
        if lines.len() < 2 {
            log::debug!("不正なレコードをスキップ: {:?}", record);
            continue;
        }

        dataset.push((strip_prefix(lines[0]), strip_prefix(lines[1])));
    }

    dataset
}

fn strip_prefix(line: &str) -> String {
    line.chars().skip(LINE_PREFIX_CHARS).collect()
}
