// 进度报告
//
// 每个流水线阶段持有一个进度任务, 总数随输入计数通道实时刷新。
// 展示方式由调用方决定; 库内只提供空实现与记录日志的实现。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;

/// 进度任务句柄
pub type TaskId = u64;

/// 一次进度更新 (未设置的字段保持不变)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub advance: u64,
    pub completed: Option<u64>,
    pub total: Option<u64>,
    pub visible: Option<bool>,
}

impl ProgressUpdate {
    pub fn advance(n: u64) -> Self {
        Self {
            advance: n,
            ..Self::default()
        }
    }

    pub fn total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    pub fn completed(mut self, completed: u64) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn visible(mut self, visible: bool) -> Self {
        self.visible = Some(visible);
        self
    }
}

/// 进度接收方
pub trait Progress: Send + Sync {
    fn add_task(&self, description: &str, visible: bool) -> TaskId;

    fn update(&self, task: TaskId, update: ProgressUpdate);

    fn remove_task(&self, task: TaskId);
}

/// 不展示进度
#[derive(Debug, Default)]
pub struct NullProgress {
    next: AtomicU64,
}

impl Progress for NullProgress {
    fn add_task(&self, _description: &str, _visible: bool) -> TaskId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    fn update(&self, _task: TaskId, _update: ProgressUpdate) {}

    fn remove_task(&self, _task: TaskId) {}
}

/// 任务状态快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskState {
    pub description: String,
    pub completed: u64,
    pub total: Option<u64>,
    pub visible: bool,
}

/// 记录任务状态并在任务结束时输出 debug 日志
#[derive(Debug, Default)]
pub struct ProgressTracker {
    next: AtomicU64,
    tasks: Mutex<BTreeMap<TaskId, TaskState>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<TaskId, TaskState> {
        self.tasks.lock().clone()
    }

    pub fn task(&self, task: TaskId) -> Option<TaskState> {
        self.tasks.lock().get(&task).cloned()
    }
}

impl Progress for ProgressTracker {
    fn add_task(&self, description: &str, visible: bool) -> TaskId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.tasks.lock().insert(
            id,
            TaskState {
                description: description.to_string(),
                visible,
                ..TaskState::default()
            },
        );
        id
    }

    fn update(&self, task: TaskId, update: ProgressUpdate) {
        let mut tasks = self.tasks.lock();
        if let Some(state) = tasks.get_mut(&task) {
            if let Some(completed) = update.completed {
                state.completed = completed;
            }
            state.completed += update.advance;
            if update.total.is_some() {
                state.total = update.total;
            }
            if let Some(visible) = update.visible {
                state.visible = visible;
            }
        }
    }

    fn remove_task(&self, task: TaskId) {
        if let Some(state) = self.tasks.lock().remove(&task) {
            debug!(
                "Progress task '{}' finished: {}/{}",
                state.description,
                state.completed,
                state.total.map(|t| t.to_string()).unwrap_or_else(|| "?".to_string())
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_updates() {
        let tracker = ProgressTracker::new();
        let task = tracker.add_task("Filtering", false);
        tracker.update(task, ProgressUpdate::advance(1).total(10).visible(true));
        tracker.update(task, ProgressUpdate::advance(2));
        let state = tracker.task(task).unwrap();
        assert_eq!(state.completed, 3);
        assert_eq!(state.total, Some(10));
        assert!(state.visible);

        tracker.update(task, ProgressUpdate::default().completed(0));
        assert_eq!(tracker.task(task).unwrap().completed, 0);

        tracker.remove_task(task);
        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn test_task_ids_are_unique() {
        let progress = NullProgress::default();
        let a = progress.add_task("a", true);
        let b = progress.add_task("b", true);
        assert_ne!(a, b);
    }
}
