// FTS token derivation
//
// The search text for an item is derived deterministically from the path
// basename: extension stripped (for media), separators flattened to spaces,
// lowercased, then per-word 2-grams appended so substring and CJK queries
// match, and finally the type label. The same input always produces the
// same token text, which keeps rebuilds idempotent.

use crate::media::ItemKind;
use crate::paths;

/// Split a basename into words on separator characters.
fn words_of(stem: &str) -> Vec<String> {
    stem.split(|c: char| c.is_whitespace() || matches!(c, '-' | '_' | '.' | ',' | '(' | ')' | '[' | ']'))
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Character 2-grams of a word. Only emitted for words of three or more
/// characters; shorter words are already their own token.
fn bigrams_of(word: &str) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    if chars.len() < 3 {
        return Vec::new();
    }
    chars.windows(2).map(|w| w.iter().collect()).collect()
}

/// Token text stored in `items_fts.name` for one item.
pub fn tokenize_name(rel: &str, kind: ItemKind) -> String {
    let base = paths::basename(rel);
    let stem = if kind.is_media() {
        match base.rsplit_once('.') {
            Some((stem, _ext)) if !stem.is_empty() => stem,
            _ => base,
        }
    } else {
        base
    };

    let words = words_of(stem);
    let mut tokens: Vec<String> = Vec::with_capacity(words.len() * 3 + 1);
    for word in &words {
        tokens.push(word.clone());
    }
    for word in &words {
        tokens.extend(bigrams_of(word));
    }
    tokens.push(kind.as_str().to_string());

    tokens.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let a = tokenize_name("trips/IMG_1234.jpg", ItemKind::Photo);
        let b = tokenize_name("trips/IMG_1234.jpg", ItemKind::Photo);
        assert_eq!(a, b);
    }

    #[test]
    fn test_separators_become_words() {
        let text = tokenize_name("a/summer-trip_2019.jpg", ItemKind::Photo);
        assert!(text.contains("summer"));
        assert!(text.contains("trip"));
        assert!(text.contains("2019"));
        assert!(text.ends_with("photo"));
    }

    #[test]
    fn test_extension_stripped_for_media_only() {
        let photo = tokenize_name("a/pic.jpg", ItemKind::Photo);
        assert!(!photo.contains("jpg"));

        // An album named with a dot keeps both words
        let album = tokenize_name("a/v2.0", ItemKind::Album);
        assert!(album.contains("v2"));
        assert!(album.contains('0'));
        assert!(album.ends_with("album"));
    }

    #[test]
    fn test_spaces_in_names() {
        let text = tokenize_name("a/beach day 01.jpg", ItemKind::Photo);
        assert!(text.contains("beach"));
        assert!(text.contains("day"));
        assert!(text.contains("01"));
    }

    #[test]
    fn test_cjk_bigrams() {
        let text = tokenize_name("a/日本旅行.jpg", ItemKind::Photo);
        // The whole word plus its 2-grams; a substring query like 旅行
        // matches through the bigram.
        assert!(text.contains("日本旅行"));
        assert!(text.contains("旅行"));
        assert!(text.contains("本旅"));
    }

    #[test]
    fn test_video_label() {
        let text = tokenize_name("a/clip.mp4", ItemKind::Video);
        assert!(text.ends_with("video"));
    }
}
