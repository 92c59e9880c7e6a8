//! 路径分隔符反转义（`\/` → `/`）
//!
//! 通用 JSON 序列化器可能把 `/` 写成 `\/`。这里把每个 `\/` 还原为单个 `/`：
//! - 先统计出现次数，得到精确的输出长度：`len - count`；
//! - 再按 `\/` 切分并用 `/` 拼回，写入预先一次性分配好的缓冲区，中途不扩容；
//! - 未被转义的 `/` 原样保留，不会被重复处理。
//!
//! 约定：输入中不含 `\/`（包括空串）时原样返回（`Cow::Borrowed`），不视为失败；
//! 仅在精确长度的缓冲区分配失败时返回错误。
use std::borrow::Cow;
use std::collections::TryReserveError;

use thiserror::Error;

/// 转义后的路径分隔符（两个字节）
pub const ESCAPED_SEPARATOR: &str = "\\/";
/// 字面路径分隔符（一个字节）
pub const PATH_SEPARATOR: char = '/';

/// 反转义失败
#[derive(Debug, Error)]
pub enum UnescapeError {
    /// 无法分配精确长度的输出缓冲区
    #[error("failed to allocate {len} bytes for unescaped output")]
    Alloc {
        len: usize,
        #[source]
        source: TryReserveError,
    },
}

/// 统计 `\/` 的非重叠出现次数
pub fn count_escaped_separators(text: &str) -> usize {
    text.matches(ESCAPED_SEPARATOR).count()
}

/// 将 `text` 中所有 `\/` 替换为 `/`，其余字节保持原有顺序
pub fn unescape_path_separators(text: &str) -> Result<Cow<'_, str>, UnescapeError> {
    let count = count_escaped_separators(text);
    if count == 0 {
        return Ok(Cow::Borrowed(text));
    }

    // 每处出现缩短恰好 1 个字节
    let len = text.len() - count * (ESCAPED_SEPARATOR.len() - PATH_SEPARATOR.len_utf8());
    let mut out = String::new();
    out.try_reserve_exact(len).map_err(|source| UnescapeError::Alloc { len, source })?;

    for (i, segment) in text.split(ESCAPED_SEPARATOR).enumerate() {
        if i > 0 {
            out.push(PATH_SEPARATOR);
        }
        out.push_str(segment);
    }
    debug_assert_eq!(out.len(), len);

    Ok(Cow::Owned(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_every_escaped_separator() {
        let out = unescape_path_separators(r"a\/b\/c").unwrap();
        assert_eq!(out, "a/b/c");
    }

    #[test]
    fn output_length_shrinks_by_occurrence_count() {
        let input = r#"{"file": "\/usr\/share\/doc\/x.txt"}"#;
        let k = count_escaped_separators(input);
        assert_eq!(k, 4);
        let out = unescape_path_separators(input).unwrap();
        assert_eq!(out.len(), input.len() - k);
        assert_eq!(out, r#"{"file": "/usr/share/doc/x.txt"}"#);
    }

    #[test]
    fn handles_occurrences_at_both_ends() {
        assert_eq!(unescape_path_separators(r"\/abc\/").unwrap(), "/abc/");
        assert_eq!(unescape_path_separators(r"\/").unwrap(), "/");
    }

    #[test]
    fn handles_consecutive_occurrences() {
        assert_eq!(unescape_path_separators(r"x\/\/\/y").unwrap(), "x///y");
    }

    #[test]
    fn leaves_unescaped_separators_alone() {
        assert_eq!(unescape_path_separators(r"a/b\/c/d").unwrap(), "a/b/c/d");
        // `\\/` 只匹配一次，剩下的反斜杠不会被再次处理
        assert_eq!(unescape_path_separators(r"a\\/b").unwrap(), r"a\/b");
    }

    #[test]
    fn zero_occurrences_borrow_input() {
        for input in ["", "plain text", "already/unescaped/path", r"back\slash"] {
            match unescape_path_separators(input).unwrap() {
                Cow::Borrowed(s) => assert_eq!(s, input),
                Cow::Owned(_) => panic!("expected borrowed output for {input:?}"),
            }
        }
    }

    #[test]
    fn keeps_multibyte_text_intact() {
        assert_eq!(unescape_path_separators(r"目录\/文件\/é.txt").unwrap(), "目录/文件/é.txt");
    }
}
