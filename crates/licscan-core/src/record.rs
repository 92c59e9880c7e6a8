//! 单文件 JSON 记录构建
//!
//! 记录为带缩进的 JSON 对象片段：
//! ```text
//! {
//!   "file": "c.txt",
//!   "licenses": [
//!     "MIT"
//!   ]
//! }
//! ```
//! 序列化时与 json-c 一样把字符串里的每个 `/` 写成 `\/`，
//! 再经过 `unescape_path_separators` 还原为字面 `/`。这样文本中的每个 `\/` 都是
//! 序列化器加上的转义，还原前后字符串的值不变（包括紧跟在反斜杠后面的 `/`）。
use std::io;
use std::path::Path;
use std::string::FromUtf8Error;

use serde::Serialize;
use serde_json::ser::{Formatter, PrettyFormatter};
use thiserror::Error;
use tracing::debug;

use crate::types::LicenseRecord;
use crate::unescape::{unescape_path_separators, UnescapeError};

/// 记录构建失败
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("serialize license record")]
    Serialize(#[from] serde_json::Error),
    #[error("license record is not valid UTF-8")]
    Utf8(#[from] FromUtf8Error),
    #[error("unescape path separators in license record")]
    Unescape(#[from] UnescapeError),
}

/// 构建单个文件的记录文本
///
/// `licenses` 的所有权被转移进记录；调用方不应再使用它。
pub fn build_record(file_path: &Path, licenses: Vec<String>, resolve_absolute: bool) -> Result<String, RecordError> {
    let record = LicenseRecord { file: file_label(file_path, resolve_absolute), licenses };
    render_record(&record)
}

/// 将已有记录渲染为最终输出文本（缩进 JSON + 分隔符反转义）
pub fn render_record(record: &LicenseRecord) -> Result<String, RecordError> {
    let mut buf = Vec::with_capacity(128);
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SlashEscapingFormatter::default());
    record.serialize(&mut ser)?;
    let pretty = String::from_utf8(buf)?;
    Ok(unescape_path_separators(&pretty)?.into_owned())
}

/// 缩进输出，字符串中的 `/` 一律写成 `\/`
#[derive(Default)]
struct SlashEscapingFormatter {
    inner: PrettyFormatter<'static>,
}

impl Formatter for SlashEscapingFormatter {
    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_array(writer)
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.inner.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object(writer)
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.inner.begin_object_key(writer, first)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.begin_object_value(writer)
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.inner.end_object_value(writer)
    }

    fn write_string_fragment<W: ?Sized + io::Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        for (i, part) in fragment.split('/').enumerate() {
            if i > 0 {
                writer.write_all(b"\\/")?;
            }
            writer.write_all(part.as_bytes())?;
        }
        Ok(())
    }
}

/// 计算 `file` 字段
/// - `resolve_absolute` 且路径可解析：规范化后的绝对路径；
/// - 否则（含解析失败：文件不存在、权限不足、悬空符号链接）：路径的最后一段。
pub fn file_label(file_path: &Path, resolve_absolute: bool) -> String {
    if resolve_absolute {
        match std::fs::canonicalize(file_path) {
            Ok(real) => return real.to_string_lossy().into_owned(),
            Err(err) => debug!(path = %file_path.display(), %err, "realpath failed, falling back to basename"),
        }
    }
    basename(file_path)
}

/// 与 POSIX `basename` 一致：`/a/b/` → `b`，`/` → `/`，空串 → `.`
fn basename(path: &Path) -> String {
    if let Some(name) = path.file_name() {
        return name.to_string_lossy().into_owned();
    }
    let raw = path.to_string_lossy();
    if raw.is_empty() {
        return ".".to_string();
    }
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() }
}
