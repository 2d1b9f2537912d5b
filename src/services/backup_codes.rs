use std::collections::HashSet;

use rand::Rng;
use sha2::{Digest, Sha256};

/// コードに使用する文字集合
///
/// 読み間違えやすい 0/O/1/I は除外（手入力されるコードのため）
const CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// バックアップコードマネージャ
///
/// 単回使用のリカバリーコードを一括生成し、SHA256ハッシュのみを
/// 永続化対象として返す。平文は発行時の一度しか存在しない
#[derive(Clone)]
pub struct BackupCodeService {
    count: usize,
    length: usize,
}

impl BackupCodeService {
    /// 新しい BackupCodeService を作成
    ///
    /// # Arguments
    /// * `count` - 一括発行するコード数
    /// * `length` - 各コードの文字数
    pub fn new(count: usize, length: usize) -> Self {
        Self { count, length }
    }

    /// コード一式を生成
    ///
    /// # Returns
    /// (平文コード一覧, 対応するハッシュ一覧)。バッチ内の重複は排除する
    pub fn generate(&self) -> (Vec<String>, Vec<String>) {
        let mut rng = rand::thread_rng();
        let mut seen = HashSet::new();
        let mut codes = Vec::with_capacity(self.count);

        while codes.len() < self.count {
            let code: String = (0..self.length)
                .map(|_| {
                    let idx = rng.gen_range(0..CODE_CHARSET.len());
                    CODE_CHARSET[idx] as char
                })
                .collect();

            if seen.insert(code.clone()) {
                codes.push(code);
            }
        }

        let hashes = codes.iter().map(|c| Self::hash_code(c)).collect();
        (codes, hashes)
    }

    /// 入力コードを正規化してSHA256でハッシュ化
    ///
    /// # Note
    /// 表示時の区切り文字や小文字入力を吸収するため、
    /// 空白とハイフンを除去し大文字に揃えてからハッシュ化する
    pub fn hash_code(candidate: &str) -> String {
        let normalized: String = candidate
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect::<String>()
            .to_uppercase();

        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_batch_size_and_length() {
        let service = BackupCodeService::new(10, 8);
        let (codes, hashes) = service.generate();

        assert_eq!(codes.len(), 10);
        assert_eq!(hashes.len(), 10);
        assert!(codes.iter().all(|c| c.len() == 8));
    }

    #[test]
    fn test_generate_charset() {
        let service = BackupCodeService::new(10, 8);
        let (codes, _) = service.generate();

        assert!(codes.iter().all(|code| {
            code.bytes().all(|b| CODE_CHARSET.contains(&b))
        }));
    }

    #[test]
    fn test_generate_no_duplicates() {
        let service = BackupCodeService::new(10, 8);
        let (codes, _) = service.generate();

        let unique: HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn test_hash_matches_generated_codes() {
        let service = BackupCodeService::new(5, 8);
        let (codes, hashes) = service.generate();

        for (code, hash) in codes.iter().zip(hashes.iter()) {
            assert_eq!(&BackupCodeService::hash_code(code), hash);
        }
    }

    #[test]
    fn test_hash_normalization() {
        let hash = BackupCodeService::hash_code("ABCD2345");
        // 小文字・区切り・前後空白は同一コードとして扱う
        assert_eq!(BackupCodeService::hash_code("abcd2345"), hash);
        assert_eq!(BackupCodeService::hash_code("ABCD-2345"), hash);
        assert_eq!(BackupCodeService::hash_code("  ABCD 2345  "), hash);
        // 別コードは別ハッシュ
        assert_ne!(BackupCodeService::hash_code("ABCD2346"), hash);
    }
}
