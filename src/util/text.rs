/// テキスト処理ユーティリティ。
///
/// キャッシュキーのハッシングと正規化済みテキストのトークン分割を提供します。
use xxhash_rust::xxh3::xxh3_128;

/// 正規化済みテキストとモデルIDからキャッシュキーを計算する。
///
/// モデルIDとテキストの間に0x00を挟み、境界の曖昧さを防ぎます。
#[must_use]
pub fn cache_key(model_id: &str, normalized_text: &str) -> u128 {
    let mut buf = Vec::with_capacity(model_id.len() + 1 + normalized_text.len());
    buf.extend_from_slice(model_id.as_bytes());
    buf.push(0);
    buf.extend_from_slice(normalized_text.as_bytes());
    xxh3_128(&buf)
}

/// 正規化済みテキストをトークンに分割する。
///
/// 正規化後のテキストは単一スペース区切りなので空白分割で十分です。
pub fn tokens(normalized_text: &str) -> impl Iterator<Item = &str> {
    normalized_text.split_whitespace()
}
