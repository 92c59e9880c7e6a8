//! 跨进程输出协调
//!
//! 多个 worker（进程或线程）共享一个输出流，需要保证：
//! - 同一时刻只有一个 worker 在写记录；
//! - “是否已写出第一条记录”的标志在所有 worker 之间共享，且只在持锁时读写；
//! - 逗号判定、写入、刷新三步都在临界区内完成，输出不会交错或缺失逗号。
//!
//! 两种实现：
//! - `OutputCoordinator`：锁文件 + 文件内的标志字节（另附记录计数），跨进程可见。编排进程在派生
//!   worker 之前 `initialize`，worker 通过句柄（锁文件路径）`attach`，全部结束后 `teardown`。
//! - `ThreadCoordinator`：单进程多线程时使用的 `Mutex<OutputState>`。
//!
//! 加锁没有超时。持锁进程异常退出时，内核会释放其文件锁，但标志与输出可能只写了一半，
//! 这种情况不做修复。
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use tempfile::TempPath;
use thiserror::Error;
use tracing::debug;

use crate::sink::OutputSink;

// 锁文件布局：[标志 1 字节][已写记录数 u64 小端 8 字节]
const FLAG_UNSET: u8 = 0;
const FLAG_SET: u8 = 1;
const STATE_LEN: usize = 9;

/// 协调器失败（除 `Action` 外均视为致命：无法保证输出是合法 JSON）
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("create shared output lock")]
    Create(#[source] io::Error),
    #[error("attach to shared output lock {path}")]
    Attach {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("acquire shared output lock")]
    Lock(#[source] io::Error),
    #[error("release shared output lock")]
    Unlock(#[source] io::Error),
    #[error("read or update shared output state")]
    State(#[source] io::Error),
    #[error("destroy shared output lock {path}")]
    Teardown {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("output lock poisoned by a panicking worker")]
    Poisoned,
    #[error("write record while holding output lock")]
    Action(#[source] io::Error),
}

/// 共享输出状态
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutputState {
    pub has_written_first: bool,
    /// 已写出的记录数（统计用，不参与逗号判定）
    pub records_written: u64,
}

/// 输出流的互斥访问
pub trait Coordinator: Sync {
    /// 阻塞直到获得独占访问，执行 `action`，然后释放
    fn with_exclusive_access<T, F>(&self, action: F) -> Result<T, CoordinatorError>
    where
        F: FnOnce(&mut OutputState) -> io::Result<T>;
}

/// 在临界区内写出一条记录：非首条记录前加逗号，写入后刷新
pub fn emit_record<C: Coordinator>(coordinator: &C, sink: &OutputSink, record: &str) -> Result<(), CoordinatorError> {
    coordinator.with_exclusive_access(|state| {
        sink.write_fragment(state.has_written_first, record)?;
        // 写成功后才置位，避免失败的首条记录导致后续出现前导逗号
        state.has_written_first = true;
        state.records_written += 1;
        Ok(())
    })
}

/// 跨进程协调器（锁文件）
#[derive(Debug)]
pub struct OutputCoordinator {
    path: PathBuf,
    // 进程内互斥：flock 以打开的文件描述为粒度，同一句柄上的多个线程彼此不互斥
    file: Mutex<File>,
    // 仅创建者持有，teardown 时删除锁文件
    owner: Option<TempPath>,
}

impl OutputCoordinator {
    /// 创建锁与标志（标志初始为 false）；须在派生任何 worker 之前调用
    pub fn initialize() -> Result<Self, CoordinatorError> {
        let tmp = tempfile::Builder::new()
            .prefix("licscan-")
            .suffix(".lock")
            .tempfile()
            .map_err(CoordinatorError::Create)?;
        let (mut file, temp_path) = tmp.into_parts();
        file.write_all(&encode_state(OutputState::default())).map_err(CoordinatorError::Create)?;
        file.flush().map_err(CoordinatorError::Create)?;

        let path = temp_path.to_path_buf();
        debug!(path = %path.display(), "output coordinator initialized");
        Ok(Self { path, file: Mutex::new(file), owner: Some(temp_path) })
    }

    /// worker 侧：通过句柄连接到已创建的协调器
    pub fn attach(handle: &Path) -> Result<Self, CoordinatorError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(handle)
            .map_err(|source| CoordinatorError::Attach { path: handle.to_path_buf(), source })?;
        Ok(Self { path: handle.to_path_buf(), file: Mutex::new(file), owner: None })
    }

    /// 跨进程句柄（传给 worker 的 `--coordinator` 参数）
    pub fn handle(&self) -> &Path {
        &self.path
    }

    /// 读取当前共享状态
    pub fn snapshot(&self) -> Result<OutputState, CoordinatorError> {
        self.with_exclusive_access(|state| Ok(*state))
    }

    /// 释放锁与共享状态；只能在所有 worker 结束后调用
    pub fn teardown(self) -> Result<(), CoordinatorError> {
        let Self { path, file, owner } = self;
        drop(file);
        if let Some(temp_path) = owner {
            temp_path.close().map_err(|source| CoordinatorError::Teardown { path: path.clone(), source })?;
            debug!(path = %path.display(), "output coordinator destroyed");
        }
        Ok(())
    }
}

impl Coordinator for OutputCoordinator {
    fn with_exclusive_access<T, F>(&self, action: F) -> Result<T, CoordinatorError>
    where
        F: FnOnce(&mut OutputState) -> io::Result<T>,
    {
        let guard = self.file.lock().map_err(|_| CoordinatorError::Poisoned)?;
        let file: &File = &guard;
        FileExt::lock_exclusive(file).map_err(CoordinatorError::Lock)?;

        let result = run_locked(file, action);
        let unlocked = FileExt::unlock(file).map_err(CoordinatorError::Unlock);

        let value = result?;
        unlocked?;
        Ok(value)
    }
}

fn run_locked<T, F>(mut file: &File, action: F) -> Result<T, CoordinatorError>
where
    F: FnOnce(&mut OutputState) -> io::Result<T>,
{
    let before = read_state(file).map_err(CoordinatorError::State)?;
    let mut state = before;
    let result = action(&mut state);
    if state != before {
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&encode_state(state)))
            .map_err(CoordinatorError::State)?;
    }
    result.map_err(CoordinatorError::Action)
}

fn read_state(mut file: &File) -> io::Result<OutputState> {
    let mut raw = [0u8; STATE_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut raw)?;
    let mut count = [0u8; 8];
    count.copy_from_slice(&raw[1..]);
    Ok(OutputState { has_written_first: raw[0] != FLAG_UNSET, records_written: u64::from_le_bytes(count) })
}

fn encode_state(state: OutputState) -> [u8; STATE_LEN] {
    let mut raw = [0u8; STATE_LEN];
    raw[0] = if state.has_written_first { FLAG_SET } else { FLAG_UNSET };
    raw[1..].copy_from_slice(&state.records_written.to_le_bytes());
    raw
}

/// 单进程多线程协调器
#[derive(Debug, Default)]
pub struct ThreadCoordinator {
    state: Mutex<OutputState>,
}

impl ThreadCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Result<OutputState, CoordinatorError> {
        self.with_exclusive_access(|state| Ok(*state))
    }
}

impl Coordinator for ThreadCoordinator {
    fn with_exclusive_access<T, F>(&self, action: F) -> Result<T, CoordinatorError>
    where
        F: FnOnce(&mut OutputState) -> io::Result<T>,
    {
        let mut state = self.state.lock().map_err(|_| CoordinatorError::Poisoned)?;
        action(&mut *state).map_err(CoordinatorError::Action)
    }
}
