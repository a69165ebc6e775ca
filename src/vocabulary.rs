use crate::corpus::Conversation;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

pub const PAD_TOKEN: &str = "<PAD>";
pub const GO_TOKEN: &str = "<GO>";
pub const EOS_TOKEN: &str = "<EOS>";

pub const PAD_ID: usize = 0;
pub const GO_ID: usize = 1;
pub const EOS_ID: usize = 2;

/// 予約トークン数（文字IDはこの直後から始まる）
pub const NUM_RESERVED: usize = 3;

/// IDが表すトークン
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Pad,
    Go,
    Eos,
    Char(char),
}

/// 永続化用のレコード（文字の順序付きリスト）
#[derive(Serialize, Deserialize, Debug)]
struct VocabularyRecord {
    chars: Vec<char>,
}

/// 文字単位の語彙（文字 ↔ ID の双方向マップ）
///
/// ID 0..3 は `<PAD>`, `<GO>`, `<EOS>` に予約。構築後は変更しない。
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    char_to_id: HashMap<char, usize>,
    id_to_char: Vec<char>,
}

impl Vocabulary {
    /// 文字の列から語彙を構築（重複除去・コードポイント順ソート）
    pub fn from_chars<I: IntoIterator<Item = char>>(chars: I) -> Self {
        // BTreeSetで重複除去とソートを同時に行う（再現性のため）
        let sorted: BTreeSet<char> = chars.into_iter().collect();
        let id_to_char: Vec<char> = sorted.into_iter().collect();

        let char_to_id = id_to_char
            .iter()
            .enumerate()
            .map(|(i, &c)| (c, i + NUM_RESERVED))
            .collect();

        Self {
            char_to_id,
            id_to_char,
        }
    }

    /// コーパスの上の句・下の句に現れる全文字から語彙を構築
    pub fn build(corpus: &[Conversation]) -> Self {
        Self::from_chars(
            corpus
                .iter()
                .flat_map(|(src, tgt)| src.chars().chain(tgt.chars())),
        )
    }

    pub fn char_to_id(&self, ch: char) -> Result<usize> {
        self.char_to_id
            .get(&ch)
            .copied()
            .ok_or(Error::UnknownCharacter(ch))
    }

    /// 文字IDを文字に戻す（予約トークンは文字ではないので `InvalidId`）
    pub fn id_to_char(&self, id: usize) -> Result<char> {
        match self.id_to_token(id)? {
            Token::Char(c) => Ok(c),
            _ => Err(Error::InvalidId(id)),
        }
    }

    pub fn id_to_token(&self, id: usize) -> Result<Token> {
        match id {
            PAD_ID => Ok(Token::Pad),
            GO_ID => Ok(Token::Go),
            EOS_ID => Ok(Token::Eos),
            _ => self
                .id_to_char
                .get(id - NUM_RESERVED)
                .map(|&c| Token::Char(c))
                .ok_or(Error::InvalidId(id)),
        }
    }

    /// 予約トークンを含む語彙サイズ
    pub fn size(&self) -> usize {
        self.id_to_char.len() + NUM_RESERVED
    }

    pub fn pad_id(&self) -> usize {
        PAD_ID
    }

    pub fn go_id(&self) -> usize {
        GO_ID
    }

    pub fn eos_id(&self) -> usize {
        EOS_ID
    }

    /// 文字列をIDの列に変換（未知の文字があれば失敗）
    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        text.chars().map(|c| self.char_to_id(c)).collect()
    }

    /// IDの列を文字列に変換
    ///
    /// `<EOS>` で打ち切り、`<PAD>` と `<GO>` は出力しない。
    pub fn decode(&self, ids: &[usize]) -> Result<String> {
        let mut text = String::new();

        for &id in ids {
            match self.id_to_token(id)? {
                Token::Eos => break,
                Token::Pad | Token::Go => {}
                Token::Char(c) => text.push(c),
            }
        }

        Ok(text)
    }

    /// JSONとして保存
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let record = VocabularyRecord {
            chars: self.id_to_char.clone(),
        };
        fs::write(path, serde_json::to_string_pretty(&record)?)?;

        log::info!("語彙を保存: {} (サイズ {})", path.display(), self.size());
        Ok(())
    }

    /// JSONから読み込み（保存時と同一のID割り当てを再現する）
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let record: VocabularyRecord = serde_json::from_str(&content)?;
        let vocab = Self::from_chars(record.chars);

        log::info!(
            "語彙を読み込み: {} (サイズ {})",
            path.as_ref().display(),
            vocab.size()
        );
        Ok(vocab)
    }
}
