//! 词级文本相似度（偏离检测、连贯性检查、目标覆盖共用）

use std::collections::BTreeSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "then", "to", "of", "in", "on", "for", "with", "is", "it",
    "this", "that", "from", "by", "at", "as", "be", "into", "after", "before", "please", "all",
];

/// 小写、去停用词、去掉复数 s 的词集合
pub fn significant_words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .map(|w| normalize(&w))
        .collect()
}

fn normalize(word: &str) -> String {
    if word.len() > 3 && word.ends_with('s') && !word.ends_with("ss") {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

/// Jaccard 相似度；两边都为空时视为相同
pub fn similarity(a: &str, b: &str) -> f64 {
    let wa = significant_words(a);
    let wb = significant_words(b);
    if wa.is_empty() && wb.is_empty() {
        return 1.0;
    }
    let inter = wa.intersection(&wb).count() as f64;
    let union = wa.union(&wb).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// target 中的词被 covered 覆盖的比例；target 为空时为 1
pub fn coverage(target: &BTreeSet<String>, covered: &BTreeSet<String>) -> f64 {
    if target.is_empty() {
        return 1.0;
    }
    target.iter().filter(|w| covered.contains(*w)).count() as f64 / target.len() as f64
}
