//! 任务依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序；排序后仍有入度的节点即构成循环。

use std::collections::{HashMap, VecDeque};

use crate::workflow::types::{TaskHandle, TaskId};

/// 任务依赖图
pub struct DependencyGraph {
    /// 任务 ID（保持 Goal 中的原始顺序，保证结果确定）
    order: Vec<TaskId>,
    /// 邻接表：任务 ID -> 依赖该任务的任务列表
    pub adjacency: HashMap<TaskId, Vec<TaskId>>,
    /// 入度表：任务 ID -> 依赖数
    pub in_degree: HashMap<TaskId, usize>,
}

impl DependencyGraph {
    /// 创建依赖图；指向未知任务的依赖边被忽略（由 Goal::validate 负责报错）
    pub fn new(tasks: &[TaskHandle]) -> Self {
        let mut order = Vec::with_capacity(tasks.len());
        let mut adjacency: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut in_degree: HashMap<TaskId, usize> = HashMap::new();

        for handle in tasks {
            let id = handle.id();
            in_degree.insert(id.clone(), 0);
            adjacency.insert(id.clone(), Vec::new());
            order.push(id);
        }

        for handle in tasks {
            let task = handle.read();
            for dep_id in &task.dependencies {
                if !in_degree.contains_key(dep_id) {
                    continue;
                }
                adjacency.entry(dep_id.clone()).or_default().push(task.id.clone());
                *in_degree.entry(task.id.clone()).or_insert(0) += 1;
            }
        }

        Self {
            order,
            adjacency,
            in_degree,
        }
    }

    /// 拓扑序；存在循环时返回参与循环（或被循环阻塞）的任务 ID
    pub fn topological_order(&self) -> Result<Vec<TaskId>, Vec<TaskId>> {
        let mut degree = self.in_degree.clone();
        let mut queue: VecDeque<TaskId> = self
            .order
            .iter()
            .filter(|id| degree.get(*id) == Some(&0))
            .cloned()
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(&id) {
                for dependent in dependents {
                    if let Some(d) = degree.get_mut(dependent) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(dependent.clone());
                        }
                    }
                }
            }
            sorted.push(id);
        }

        if sorted.len() == self.order.len() {
            Ok(sorted)
        } else {
            Err(self
                .order
                .iter()
                .filter(|id| degree.get(*id).copied().unwrap_or(0) > 0)
                .cloned()
                .collect())
        }
    }

    /// 直接依赖该任务的任务
    pub fn dependents(&self, task_id: &str) -> &[TaskId] {
        self.adjacency.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Task;

    fn handles(tasks: Vec<Task>) -> Vec<TaskHandle> {
        tasks.into_iter().map(TaskHandle::new).collect()
    }

    #[test]
    fn test_graph_construction_chain() {
        let tasks = handles(vec![
            Task::new("a", "first"),
            Task::new("b", "second").depends_on(["a"]),
        ]);
        let graph = DependencyGraph::new(&tasks);

        assert_eq!(graph.in_degree.get("a"), Some(&0));
        assert_eq!(graph.in_degree.get("b"), Some(&1));
        assert_eq!(graph.dependents("a"), ["b".to_string()]);
    }

    #[test]
    fn test_topological_order_out_of_declaration_order() {
        let tasks = handles(vec![
            Task::new("c", "third").depends_on(["b"]),
            Task::new("b", "second").depends_on(["a"]),
            Task::new("a", "first"),
        ]);
        let order = DependencyGraph::new(&tasks).topological_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_detected() {
        let tasks = handles(vec![
            Task::new("a", "first").depends_on(["c"]),
            Task::new("b", "second").depends_on(["a"]),
            Task::new("c", "third").depends_on(["b"]),
            Task::new("d", "independent"),
        ]);
        let cycle = DependencyGraph::new(&tasks).topological_order().unwrap_err();
        assert_eq!(cycle, vec!["a", "b", "c"]);
    }
}
