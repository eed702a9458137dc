use sha2::{Digest, Sha256};

/// メールアドレスから決定的なアバターURLを生成する
///
/// # 引数
/// * `email` - ユーザーのメールアドレス
///
/// # 戻り値
/// 正規化（前後空白除去・小文字化）したメールアドレスのSHA-256ハッシュに
/// 基づくidenticon画像のURL。同じメールアドレスからは常に同じURLが得られる。
pub fn avatar_url_for(email: &str) -> String {
    let normalized = email.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());

    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }

    format!("https://www.gravatar.com/avatar/{hex}?d=identicon")
}
