//! 任务监管：每个任务一个子 CancellationToken
//!
//! 根 token 取消时所有任务一起取消；cancel_task 只取消单个任务的 token，
//! 执行中的分支在下一个挂起点观察到取消。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct TaskSupervisor {
    root: CancellationToken,
    tasks: Mutex<HashMap<String, CancellationToken>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// 取得（必要时创建）任务的 token
    pub fn token(&self, task_id: &str) -> CancellationToken {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(task_id.to_string())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// 取消单个任务；返回该任务此前是否已登记
    pub fn cancel(&self, task_id: &str) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        match tasks.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, task_id: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// 任务结束后移除 token
    pub fn finish(&self, task_id: &str) {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }

    /// 关闭：取消全部任务
    pub fn cancel_all(&self) {
        self.root.cancel();
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_scoped_to_task() {
        let sup = TaskSupervisor::new();
        let a = sup.token("a");
        let b = sup.token("b");
        assert!(sup.cancel("a"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!sup.cancel("ghost"));
        sup.cancel_all();
        assert!(b.is_cancelled());
        sup.finish("a");
        assert!(!sup.is_cancelled("a"));
    }
}
