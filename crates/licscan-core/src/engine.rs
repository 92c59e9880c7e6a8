//! 单文件许可证检测（字节级）
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

use crate::detectors::LicenseDetector;

/// 读取整个文件并检测许可证；疑似二进制文件返回空列表
pub fn detect_file(path: &Path, detector: &LicenseDetector) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).with_context(|| format!("read {}", path.display()))?;

    if is_probably_binary(&buf) {
        debug!(path = %path.display(), "binary file, no licenses reported");
        return Ok(Vec::new());
    }

    Ok(detector.detect(&buf))
}

/// 判定缓冲区是否“明显是二进制”
/// 策略（保守，尽量不误杀文本）：
/// - 只要包含任何 NUL 字节（0x00）即认为二进制；
/// - 否则计算可打印 ASCII 比例（包含 tab/CR/LF），低于 25% 则认为二进制。
fn is_probably_binary(buf: &[u8]) -> bool {
    if buf.is_empty() { return false; }
    if buf.iter().any(|&b| b == 0) { return true; }
    let printable = buf.iter().filter(|&&b| matches!(b, 0x09 | 0x0A | 0x0D) || (0x20..=0x7E).contains(&b)).count();
    let ratio = printable as f32 / (buf.len() as f32);
    ratio < 0.25
}
