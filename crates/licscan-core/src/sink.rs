//! 输出目标（stdout / 文件 / 内存缓冲）
use std::fs::File;
use std::io::{self, Write};
use std::process::Stdio;
use std::sync::Mutex;

/// 所有 worker 共享的字节输出流
///
/// 写入接口只需要 `&self`：stdout 自带锁，`&File` 实现了 `Write`，
/// 内存缓冲由 `Mutex` 保护。记录之间的互斥由协调器负责，这里只保证单次写入完整。
#[derive(Debug)]
pub enum OutputSink {
    Stdout,
    File(File),
    /// 测试与嵌入场景使用
    Buffer(Mutex<Vec<u8>>),
}

impl OutputSink {
    pub fn buffer() -> Self {
        OutputSink::Buffer(Mutex::new(Vec::new()))
    }

    /// 写入一段原始文本并立即刷新
    pub fn write_raw(&self, text: &str) -> io::Result<()> {
        match self {
            OutputSink::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(text.as_bytes())?;
                out.flush()
            }
            OutputSink::File(file) => {
                let mut out: &File = file;
                out.write_all(text.as_bytes())?;
                out.flush()
            }
            OutputSink::Buffer(buf) => {
                let mut buf = buf.lock().map_err(|_| io::Error::new(io::ErrorKind::Other, "output buffer poisoned"))?;
                buf.extend_from_slice(text.as_bytes());
                Ok(())
            }
        }
    }

    /// 写入一条记录：可选的逗号前缀 + 记录文本 + 换行，一次写出
    pub fn write_fragment(&self, with_comma: bool, record: &str) -> io::Result<()> {
        let mut line = String::with_capacity(record.len() + 2);
        if with_comma {
            line.push(',');
        }
        line.push_str(record);
        line.push('\n');
        self.write_raw(&line)
    }

    /// 子进程继承的 stdout：与本输出流共享同一个文件描述（含写偏移）
    pub fn child_stdio(&self) -> io::Result<Stdio> {
        match self {
            OutputSink::Stdout => Ok(Stdio::inherit()),
            OutputSink::File(file) => Ok(Stdio::from(file.try_clone()?)),
            OutputSink::Buffer(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "in-memory output cannot be shared with worker processes",
            )),
        }
    }

    /// 读取内存缓冲中的内容（仅 Buffer 有值）
    pub fn contents(&self) -> Option<String> {
        match self {
            OutputSink::Buffer(buf) => buf.lock().ok().map(|b| String::from_utf8_lossy(&b).into_owned()),
            _ => None,
        }
    }
}
