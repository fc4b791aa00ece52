//! 任务历史
//!
//! 每个进入终态的任务追加一条记录，按任务 ID 可查。

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::error::AppError;
use crate::farm::JobId;
use crate::farm::pipeline::Job;

/// 任务历史存储
///
/// `append` 在执行器的归档路径上调用，不允许阻塞在 IO 上。
#[async_trait]
pub trait JobHistory: Send + Sync {
    /// 追加一个终态任务
    fn append(&self, job: Job) -> Result<(), AppError>;

    /// 最近的 `n` 个任务，最新的在前
    fn recent(&self, n: usize) -> Vec<Job>;

    async fn get(&self, id: JobId) -> Option<Job>;

    /// 等待已追加的记录持久化
    async fn flush(&self) {}
}

/// 内存中的有界历史
pub struct MemoryHistory {
    limit: usize,
    jobs: Mutex<VecDeque<Job>>,
}

impl MemoryHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            jobs: Mutex::new(VecDeque::new()),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, job: Job) {
        let mut jobs = self.jobs();
        jobs.push_back(job);
        while jobs.len() > self.limit {
            jobs.pop_front();
        }
    }

    fn find(&self, id: JobId) -> Option<Job> {
        self.jobs().iter().rev().find(|job| job.id == id).cloned()
    }

    fn len(&self) -> usize {
        self.jobs().len()
    }
}

#[async_trait]
impl JobHistory for MemoryHistory {
    fn append(&self, job: Job) -> Result<(), AppError> {
        self.push(job);
        Ok(())
    }

    fn recent(&self, n: usize) -> Vec<Job> {
        self.jobs().iter().rev().take(n).cloned().collect()
    }

    async fn get(&self, id: JobId) -> Option<Job> {
        self.find(id)
    }
}

enum WriterCommand {
    Append(Box<Job>),
    /// 之前的记录全部落盘后回复
    Sync(oneshot::Sender<()>),
}

/// JSONL 文件历史，每行一个任务，同时在内存中保留最近的记录
///
/// 文件由独立的写线程追加，内存中的记录在 `append` 返回前就已可查。
pub struct JsonlHistory {
    path: PathBuf,
    memory: MemoryHistory,
    writer: mpsc::UnboundedSender<WriterCommand>,
}

impl JsonlHistory {
    /// 打开历史文件，加载最近的记录并启动写线程
    pub fn open<P: AsRef<Path>>(path: P, limit: usize) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let memory = MemoryHistory::new(limit);
        if path.exists() {
            for job in read_jobs(&path)? {
                memory.push(job);
            }
            info!(path = %path.display(), loaded = memory.len(), "已加载任务历史");
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let (writer, commands) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("job-history-writer".to_string())
            .spawn({
                let path = path.clone();
                move || write_loop(file, path, commands)
            })?;

        Ok(Self {
            path,
            memory,
            writer,
        })
    }
}

fn write_loop(mut file: File, path: PathBuf, mut commands: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = commands.blocking_recv() {
        match command {
            WriterCommand::Append(job) => {
                let written = serde_json::to_string(&job)
                    .map_err(AppError::from)
                    .and_then(|mut line| {
                        line.push('\n');
                        file.write_all(line.as_bytes())?;
                        file.flush()?;
                        Ok(())
                    });
                if let Err(e) = written {
                    error!(job_id = %job.id, path = %path.display(), "写入任务历史失败: {}", e);
                }
            }
            WriterCommand::Sync(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn read_jobs(path: &Path) -> Result<Vec<Job>, AppError> {
    let reader = BufReader::new(File::open(path)?);
    let mut jobs = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Job>(&line) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!(line = index + 1, "跳过无法解析的历史记录: {}", e),
        }
    }

    Ok(jobs)
}

#[async_trait]
impl JobHistory for JsonlHistory {
    fn append(&self, job: Job) -> Result<(), AppError> {
        self.memory.push(job.clone());
        self.writer
            .send(WriterCommand::Append(Box::new(job)))
            .map_err(|_| AppError::IoError(std::io::Error::other("历史写线程已退出")))
    }

    fn recent(&self, n: usize) -> Vec<Job> {
        self.memory.recent(n)
    }

    async fn get(&self, id: JobId) -> Option<Job> {
        if let Some(job) = self.memory.find(id) {
            return Some(job);
        }

        self.flush().await;
        let path = self.path.clone();
        let scanned = tokio::task::spawn_blocking(move || read_jobs(&path)).await;

        match scanned {
            Ok(Ok(jobs)) => jobs.into_iter().rev().find(|job| job.id == id),
            Ok(Err(e)) => {
                warn!(path = %self.path.display(), "读取任务历史失败: {}", e);
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), "读取任务历史的任务异常: {}", e);
                None
            }
        }
    }

    async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.writer.send(WriterCommand::Sync(done)).is_ok() {
            let _ = wait.await;
        }
    }
}
