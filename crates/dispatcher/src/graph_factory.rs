use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use taskgraph_core::{
    models::{
        Dependencies, GraphContext, GraphDefinition, GraphObject, GraphTaskEntry, TaskDependencyItem,
        TaskState,
    },
    traits::TaskGraphStore,
    TaskGraphError, TaskGraphResult,
};

/// 由定义实例化出的任务图及其任务依赖描述
#[derive(Debug, Clone)]
pub struct GraphInstance {
    pub graph: GraphObject,
    pub tasks: Vec<TaskDependencyItem>,
}

/// 任务图实例化
pub struct GraphFactory {
    store: Arc<dyn TaskGraphStore>,
}

impl GraphFactory {
    pub fn new(store: Arc<dyn TaskGraphStore>) -> Self {
        Self { store }
    }

    /// label 唯一、waitOn 引用已知 label、依赖无环
    pub fn validate(definition: &GraphDefinition) -> TaskGraphResult<()> {
        if definition.injectable_name.trim().is_empty() {
            return Err(TaskGraphError::validation_error("任务图定义名称不能为空"));
        }
        if definition.tasks.is_empty() {
            return Err(TaskGraphError::validation_error(format!(
                "任务图定义 {} 不包含任何任务",
                definition.injectable_name
            )));
        }

        let mut labels = HashSet::new();
        for task in &definition.tasks {
            if task.label.trim().is_empty() {
                return Err(TaskGraphError::validation_error("任务label不能为空"));
            }
            if !labels.insert(task.label.as_str()) {
                return Err(TaskGraphError::validation_error(format!(
                    "任务label重复: {}",
                    task.label
                )));
            }
        }

        for task in &definition.tasks {
            for dependency in task.wait_on.keys() {
                if dependency == &task.label {
                    return Err(TaskGraphError::InvalidDependency {
                        task: task.label.clone(),
                        dependency: dependency.clone(),
                        reason: "任务不能依赖自身".to_string(),
                    });
                }
                if !labels.contains(dependency.as_str()) {
                    return Err(TaskGraphError::InvalidDependency {
                        task: task.label.clone(),
                        dependency: dependency.clone(),
                        reason: "依赖的任务不存在".to_string(),
                    });
                }
            }
            if let Some(states) = &task.terminal_on_states {
                if states.contains(&TaskState::Pending) {
                    return Err(TaskGraphError::validation_error(format!(
                        "任务 {} 的终止状态不能包含 pending",
                        task.label
                    )));
                }
            }
        }

        let graph: HashMap<&str, Vec<&str>> = definition
            .tasks
            .iter()
            .map(|t| (t.label.as_str(), t.wait_on.keys().map(String::as_str).collect()))
            .collect();
        let remaining = Self::unsorted_nodes(&graph);
        if !remaining.is_empty() {
            return Err(TaskGraphError::CircularDependency(format!(
                "任务图定义 {} 中的任务存在环: {}",
                definition.injectable_name,
                remaining.join(", ")
            )));
        }
        Ok(())
    }

    /// Kahn拓扑排序，返回无法排序（处于环上或依赖环）的节点
    fn unsorted_nodes<'a>(graph: &HashMap<&'a str, Vec<&'a str>>) -> Vec<&'a str> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut queue = VecDeque::new();

        for (&node, dependencies) in graph {
            in_degree.insert(node, dependencies.len());
            for &dep in dependencies {
                dependents.entry(dep).or_default().push(node);
            }
        }
        for (&node, &degree) in &in_degree {
            if degree == 0 {
                queue.push_back(node);
            }
        }

        while let Some(node) = queue.pop_front() {
            if let Some(children) = dependents.get(node) {
                for &child in children {
                    if let Some(degree) = in_degree.get_mut(child) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(child);
                        }
                    }
                }
            }
        }

        let mut remaining: Vec<&str> = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(node, _)| node)
            .collect();
        remaining.sort_unstable();
        remaining
    }

    /// 为每个任务分配ID，生成任务图记录（含镜像）和任务依赖描述
    pub fn instantiate(
        definition: &GraphDefinition,
        context: GraphContext,
        domain: &str,
    ) -> TaskGraphResult<GraphInstance> {
        Self::validate(definition)?;

        let ids: HashMap<&str, Uuid> = definition
            .tasks
            .iter()
            .map(|t| (t.label.as_str(), Uuid::new_v4()))
            .collect();

        let mut graph = GraphObject::new(
            definition.injectable_name.clone(),
            serde_json::to_value(definition)?,
            context,
        )
        .with_domain(domain);
        graph.service_graph = definition.service_graph;

        let mut entries = BTreeMap::new();
        let mut tasks = Vec::with_capacity(definition.tasks.len());
        for task in &definition.tasks {
            let task_id = ids[task.label.as_str()];
            let dependencies: Dependencies = task
                .wait_on
                .iter()
                .map(|(label, required)| (ids[label.as_str()], *required))
                .collect();

            entries.insert(
                task_id,
                GraphTaskEntry {
                    label: task.label.clone(),
                    task_name: task.task_name.clone(),
                    options: task.options.clone(),
                    state: TaskState::Pending,
                    error: None,
                },
            );
            tasks.push(TaskDependencyItem {
                task_id,
                domain: domain.to_string(),
                dependencies,
                terminal_on_states: task.terminal_states(),
            });
        }
        graph.tasks = entries;

        Ok(GraphInstance { graph, tasks })
    }

    /// 先写任务图记录，再写任务依赖记录
    ///
    /// 没有依赖的任务最后写入，它们可被领取时其余任务已经存在。
    #[instrument(skip(self, definition, context), fields(name = %definition.injectable_name))]
    pub async fn submit(
        &self,
        definition: &GraphDefinition,
        context: GraphContext,
        domain: &str,
    ) -> TaskGraphResult<GraphObject> {
        let instance = Self::instantiate(definition, context, domain)?;
        self.store.persist_graph_object(&instance.graph).await?;

        let (roots, dependents): (Vec<_>, Vec<_>) = instance
            .tasks
            .iter()
            .partition(|item| item.dependencies.is_empty());
        for item in dependents.into_iter().chain(roots) {
            self.store
                .persist_task_dependencies(item, instance.graph.instance_id)
                .await?;
        }
        info!(
            "已创建任务图 {} ({})，包含 {} 个任务",
            instance.graph.name,
            instance.graph.instance_id,
            instance.tasks.len()
        );
        Ok(instance.graph)
    }

    pub async fn submit_by_name(
        &self,
        injectable_name: &str,
        context: GraphContext,
        domain: &str,
    ) -> TaskGraphResult<GraphObject> {
        let definition = self.store.get_graph_definition(injectable_name).await?;
        self.submit(&definition, context, domain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgraph_core::models::{RequiredState, TaskDefinitionEntry};

    fn entry(label: &str, wait_on: &[(&str, RequiredState)]) -> TaskDefinitionEntry {
        TaskDefinitionEntry {
            label: label.to_string(),
            task_name: "noop".to_string(),
            wait_on: wait_on
                .iter()
                .map(|(l, s)| (l.to_string(), *s))
                .collect(),
            terminal_on_states: None,
            options: serde_json::Value::Null,
        }
    }

    fn definition(tasks: Vec<TaskDefinitionEntry>) -> GraphDefinition {
        GraphDefinition {
            injectable_name: "Graph.Test".to_string(),
            friendly_name: "Test".to_string(),
            tasks,
            service_graph: false,
        }
    }

    #[test]
    fn test_validate_accepts_diamond() {
        let succeeded = RequiredState::Exactly(TaskState::Succeeded);
        let def = definition(vec![
            entry("a", &[]),
            entry("b", &[("a", succeeded)]),
            entry("c", &[("a", RequiredState::Finished)]),
            entry("d", &[("b", succeeded), ("c", succeeded)]),
        ]);
        assert!(GraphFactory::validate(&def).is_ok());
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let def = definition(vec![
            entry("root", &[]),
            entry("a", &[("c", RequiredState::Finished)]),
            entry("b", &[("a", RequiredState::Finished)]),
            entry("c", &[("b", RequiredState::Finished)]),
        ]);
        match GraphFactory::validate(&def) {
            Err(TaskGraphError::CircularDependency(message)) => {
                assert!(message.contains("a, b, c"));
                assert!(!message.contains("root"));
            }
            other => panic!("应检测到循环依赖: {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_bad_references() {
        let def = definition(vec![entry("a", &[("missing", RequiredState::Finished)])]);
        assert!(matches!(
            GraphFactory::validate(&def),
            Err(TaskGraphError::InvalidDependency { .. })
        ));

        let def = definition(vec![entry("a", &[("a", RequiredState::Finished)])]);
        assert!(matches!(
            GraphFactory::validate(&def),
            Err(TaskGraphError::InvalidDependency { .. })
        ));

        let def = definition(vec![entry("a", &[]), entry("a", &[])]);
        assert!(matches!(
            GraphFactory::validate(&def),
            Err(TaskGraphError::ValidationError(_))
        ));

        assert!(GraphFactory::validate(&definition(vec![])).is_err());
    }

    #[test]
    fn test_instantiate_maps_labels_to_ids() {
        let def = definition(vec![
            entry("a", &[]),
            entry("b", &[("a", RequiredState::Exactly(TaskState::Failed))]),
        ]);
        let mut context = GraphContext::new();
        context.insert("target".to_string(), serde_json::json!("node-7"));

        let instance = GraphFactory::instantiate(&def, context, "lab").unwrap();
        assert_eq!(instance.graph.domain, "lab");
        assert_eq!(instance.graph.context_target, "node-7");
        assert_eq!(instance.graph.tasks.len(), 2);
        assert_eq!(instance.tasks.len(), 2);

        let a = &instance.tasks[0];
        let b = &instance.tasks[1];
        assert!(a.dependencies.is_empty());
        assert_eq!(
            b.dependencies.get(&a.task_id),
            Some(&RequiredState::Exactly(TaskState::Failed))
        );
        assert_eq!(instance.graph.tasks[&a.task_id].label, "a");
        assert_eq!(
            b.terminal_on_states,
            vec![TaskState::Failed, TaskState::Timeout, TaskState::Cancelled]
        );
        assert!(instance.tasks.iter().all(|t| t.domain == "lab"));
    }
}
