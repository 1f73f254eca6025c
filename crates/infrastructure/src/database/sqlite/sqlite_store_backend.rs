use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use taskgraph_core::{
    config::BackendKind,
    models::{GraphDefinition, GraphObject, TaskDependency, TaskState},
    traits::{
        ConditionalUpdate, GraphMutation, GraphPrecondition, GraphQuery, LeaseUpdate,
        StoreBackend, TaskMutation, TaskPrecondition, TaskQuery,
    },
    TaskGraphError, TaskGraphResult,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::database::mapping::MappingHelpers;

const TASK_COLUMNS: &str = "task_id, graph_id, domain, state, reachable, evaluated, dependencies, \
     terminal_on_states, lease_owner, lease_heartbeat, context, rowrev, created_at, updated_at";

const GRAPH_COLUMNS: &str = "instance_id, name, definition, tasks, context, status, domain, \
     context_target, service_graph, rowrev, created_at, updated_at";

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS task_dependencies (
        task_id TEXT PRIMARY KEY,
        graph_id TEXT NOT NULL,
        domain TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'pending',
        reachable INTEGER NOT NULL DEFAULT 1,
        evaluated INTEGER NOT NULL DEFAULT 0,
        dependencies TEXT NOT NULL DEFAULT '{}',
        terminal_on_states TEXT NOT NULL DEFAULT '[]',
        lease_owner TEXT NOT NULL DEFAULT '',
        lease_heartbeat INTEGER NOT NULL,
        context TEXT,
        rowrev TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS graph_objects (
        instance_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        definition TEXT NOT NULL,
        tasks TEXT NOT NULL DEFAULT '{}',
        context TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'pending',
        domain TEXT NOT NULL,
        context_target TEXT NOT NULL DEFAULT '',
        service_graph INTEGER NOT NULL DEFAULT 0,
        rowrev TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS graph_definitions (
        injectable_name TEXT PRIMARY KEY,
        friendly_name TEXT NOT NULL,
        tasks TEXT NOT NULL,
        service_graph INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_dependencies_graph ON task_dependencies(graph_id)",
    "CREATE INDEX IF NOT EXISTS idx_task_dependencies_ready ON task_dependencies(domain, state, reachable)",
    "CREATE INDEX IF NOT EXISTS idx_task_dependencies_lease ON task_dependencies(lease_owner, lease_heartbeat)",
    "CREATE INDEX IF NOT EXISTS idx_task_dependencies_evaluated ON task_dependencies(evaluated, state)",
    "CREATE INDEX IF NOT EXISTS idx_graph_objects_status ON graph_objects(status, domain)",
    "CREATE INDEX IF NOT EXISTS idx_graph_objects_target ON graph_objects(context_target)",
];

/// SQLite 存储后端
///
/// 只有单行 compare-and-swap：`UPDATE … WHERE <前置条件>` 之后根据影响行数
/// 判断是否生效，再读取当前行返回给调用方。
pub struct SqliteStoreBackend {
    pool: SqlitePool,
}

impl SqliteStoreBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_task(row: &SqliteRow) -> TaskGraphResult<TaskDependency> {
        let state: String = row.try_get("state")?;
        Ok(TaskDependency {
            task_id: MappingHelpers::parse_uuid_sqlite(row, "task_id")?,
            graph_id: MappingHelpers::parse_uuid_sqlite(row, "graph_id")?,
            domain: row.try_get("domain")?,
            state: state.parse()?,
            reachable: row.try_get("reachable")?,
            evaluated: row.try_get("evaluated")?,
            dependencies: MappingHelpers::parse_json_sqlite(row, "dependencies")?,
            terminal_on_states: MappingHelpers::parse_json_sqlite(row, "terminal_on_states")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_heartbeat: MappingHelpers::parse_millis_sqlite(row, "lease_heartbeat")?,
            context: MappingHelpers::parse_optional_json_sqlite(row, "context")?,
            rowrev: row.try_get("rowrev")?,
            created_at: MappingHelpers::parse_millis_sqlite(row, "created_at")?,
            updated_at: MappingHelpers::parse_millis_sqlite(row, "updated_at")?,
        })
    }

    fn row_to_graph(row: &SqliteRow) -> TaskGraphResult<GraphObject> {
        let status: String = row.try_get("status")?;
        Ok(GraphObject {
            instance_id: MappingHelpers::parse_uuid_sqlite(row, "instance_id")?,
            name: row.try_get("name")?,
            definition: MappingHelpers::parse_json_sqlite(row, "definition")?,
            tasks: MappingHelpers::parse_json_sqlite(row, "tasks")?,
            context: MappingHelpers::parse_json_sqlite(row, "context")?,
            status: status.parse()?,
            domain: row.try_get("domain")?,
            context_target: row.try_get("context_target")?,
            service_graph: row.try_get("service_graph")?,
            rowrev: row.try_get("rowrev")?,
            created_at: MappingHelpers::parse_millis_sqlite(row, "created_at")?,
            updated_at: MappingHelpers::parse_millis_sqlite(row, "updated_at")?,
        })
    }

    fn row_to_definition(row: &SqliteRow) -> TaskGraphResult<GraphDefinition> {
        Ok(GraphDefinition {
            injectable_name: row.try_get("injectable_name")?,
            friendly_name: row.try_get("friendly_name")?,
            tasks: MappingHelpers::parse_json_sqlite(row, "tasks")?,
            service_graph: row.try_get("service_graph")?,
        })
    }

    fn push_task_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &TaskQuery) {
        qb.push(" WHERE 1 = 1");
        if let Some(graph_id) = query.graph_id {
            qb.push(" AND graph_id = ").push_bind(graph_id.to_string());
        }
        if let Some(domain) = &query.domain {
            qb.push(" AND domain = ").push_bind(domain.clone());
        }
        if let Some(states) = &query.states {
            if states.is_empty() {
                qb.push(" AND 1 = 0");
            } else {
                qb.push(" AND state IN (");
                let mut list = qb.separated(", ");
                for state in states {
                    list.push_bind(state.as_str());
                }
                qb.push(")");
            }
        }
        if let Some(reachable) = query.reachable {
            qb.push(" AND reachable = ").push_bind(reachable);
        }
        if let Some(evaluated) = query.evaluated {
            qb.push(" AND evaluated = ").push_bind(evaluated);
        }
        if let Some(owner) = &query.lease_owner {
            qb.push(" AND lease_owner = ").push_bind(owner.clone());
        }
        match query.leased {
            Some(true) => {
                qb.push(" AND lease_owner <> ''");
            }
            Some(false) => {
                qb.push(" AND lease_owner = ''");
            }
            None => {}
        }
        if let Some(before) = query.heartbeat_before {
            qb.push(" AND lease_heartbeat < ")
                .push_bind(before.timestamp_millis());
        }
        if query.no_outstanding_dependencies {
            qb.push(" AND dependencies = '{}'");
        }
        if let Some(upstream) = query.depends_on {
            qb.push(" AND json_extract(dependencies, '$.\"' || ")
                .push_bind(upstream.to_string())
                .push(" || '\"') IS NOT NULL");
        }
        qb.push(" ORDER BY created_at, task_id");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
    }

    fn push_task_mutation(
        qb: &mut QueryBuilder<'_, Sqlite>,
        mutation: &TaskMutation,
    ) -> TaskGraphResult<()> {
        let context = match &mutation.context {
            Some(context) => Some(MappingHelpers::to_optional_json_text(context.as_ref())?),
            None => None,
        };
        let dependencies = mutation
            .dependencies
            .as_ref()
            .map(MappingHelpers::to_json_text)
            .transpose()?;

        let mut sets = qb.separated(", ");
        sets.push("rowrev = ")
            .push_bind_unseparated(Uuid::new_v4().to_string());
        sets.push("updated_at = ")
            .push_bind_unseparated(Utc::now().timestamp_millis());
        if let Some(state) = mutation.state {
            sets.push("state = ").push_bind_unseparated(state.as_str());
        }
        if let Some(context) = context {
            sets.push("context = ").push_bind_unseparated(context);
        }
        if let Some(dependencies) = dependencies {
            sets.push("dependencies = ").push_bind_unseparated(dependencies);
        }
        if mutation.mark_unreachable {
            sets.push("reachable = 0");
        }
        if mutation.mark_evaluated {
            sets.push("evaluated = 1");
        }
        match &mutation.lease {
            Some(LeaseUpdate::Acquire { owner, heartbeat }) => {
                sets.push("lease_owner = ").push_bind_unseparated(owner.clone());
                sets.push("lease_heartbeat = ")
                    .push_bind_unseparated(heartbeat.timestamp_millis());
            }
            Some(LeaseUpdate::Renew { heartbeat }) => {
                sets.push("lease_heartbeat = ")
                    .push_bind_unseparated(heartbeat.timestamp_millis());
            }
            Some(LeaseUpdate::Release) => {
                sets.push("lease_owner = ''");
            }
            None => {}
        }
        Ok(())
    }

    fn push_task_precondition(qb: &mut QueryBuilder<'_, Sqlite>, precondition: &TaskPrecondition) {
        match precondition {
            TaskPrecondition::Revision(rowrev) => {
                qb.push(" AND rowrev = ").push_bind(rowrev.clone());
            }
            TaskPrecondition::LeaseOwner(owner) => {
                qb.push(" AND lease_owner = ").push_bind(owner.clone());
            }
            TaskPrecondition::LeaseClaim(claim) => {
                qb.push(" AND lease_owner = ").push_bind(claim.owner.clone());
                qb.push(" AND lease_heartbeat = ")
                    .push_bind(claim.heartbeat.timestamp_millis());
            }
            TaskPrecondition::Claimable => {
                qb.push(" AND lease_owner = '' AND reachable = 1 AND state = ")
                    .push_bind(TaskState::Pending.as_str());
            }
        }
    }
}

#[async_trait]
impl StoreBackend for SqliteStoreBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    #[instrument(skip(self))]
    async fn migrate(&self) -> TaskGraphResult<()> {
        debug!("运行SQLite数据库迁移");
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(TaskGraphError::Database)?;
        }
        debug!("SQLite数据库迁移完成");
        Ok(())
    }

    async fn health_check(&self) -> TaskGraphResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| TaskGraphError::BackendUnavailable(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, task), fields(task_id = %task.task_id, graph_id = %task.graph_id))]
    async fn insert_task(&self, task: &TaskDependency) -> TaskGraphResult<()> {
        sqlx::query(&format!(
            "INSERT INTO task_dependencies ({TASK_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(task.task_id.to_string())
        .bind(task.graph_id.to_string())
        .bind(&task.domain)
        .bind(task.state.as_str())
        .bind(task.reachable)
        .bind(task.evaluated)
        .bind(MappingHelpers::to_json_text(&task.dependencies)?)
        .bind(MappingHelpers::to_json_text(&task.terminal_on_states)?)
        .bind(&task.lease_owner)
        .bind(task.lease_heartbeat.timestamp_millis())
        .bind(MappingHelpers::to_optional_json_text(task.context.as_ref())?)
        .bind(&task.rowrev)
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(TaskGraphError::Database)?;

        debug!("插入任务依赖记录成功");
        Ok(())
    }

    async fn read_task(&self, task_id: Uuid) -> TaskGraphResult<Option<TaskDependency>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM task_dependencies WHERE task_id = ?"
        ))
        .bind(task_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(TaskGraphError::Database)?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn query_tasks(&self, query: &TaskQuery) -> TaskGraphResult<Vec<TaskDependency>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TASK_COLUMNS} FROM task_dependencies"
        ));
        Self::push_task_filters(&mut qb, query);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(TaskGraphError::Database)?;

        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self, mutation), fields(task_id = %task_id))]
    async fn try_update_task(
        &self,
        task_id: Uuid,
        precondition: &TaskPrecondition,
        mutation: &TaskMutation,
    ) -> TaskGraphResult<ConditionalUpdate<TaskDependency>> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE task_dependencies SET ");
        Self::push_task_mutation(&mut qb, mutation)?;
        qb.push(" WHERE task_id = ").push_bind(task_id.to_string());
        Self::push_task_precondition(&mut qb, precondition);

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(TaskGraphError::Database)?;

        let current = self.read_task(task_id).await?;
        if result.rows_affected() == 1 {
            Ok(ConditionalUpdate {
                applied: true,
                current,
            })
        } else {
            debug!("条件更新未生效: {:?}", precondition);
            Ok(ConditionalUpdate::rejected(current))
        }
    }

    async fn delete_tasks(&self, task_ids: &[Uuid]) -> TaskGraphResult<u64> {
        if task_ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM task_dependencies WHERE task_id IN (");
        {
            let mut list = qb.separated(", ");
            for task_id in task_ids {
                list.push_bind(task_id.to_string());
            }
        }
        qb.push(")");

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(TaskGraphError::Database)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, graph), fields(graph_id = %graph.instance_id))]
    async fn insert_graph(&self, graph: &GraphObject) -> TaskGraphResult<()> {
        sqlx::query(&format!(
            "INSERT INTO graph_objects ({GRAPH_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(graph.instance_id.to_string())
        .bind(&graph.name)
        .bind(MappingHelpers::to_json_text(&graph.definition)?)
        .bind(MappingHelpers::to_json_text(&graph.tasks)?)
        .bind(MappingHelpers::to_json_text(&graph.context)?)
        .bind(graph.status.as_str())
        .bind(&graph.domain)
        .bind(&graph.context_target)
        .bind(graph.service_graph)
        .bind(&graph.rowrev)
        .bind(graph.created_at.timestamp_millis())
        .bind(graph.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(TaskGraphError::Database)?;

        debug!("插入任务图记录成功");
        Ok(())
    }

    async fn read_graph(&self, instance_id: Uuid) -> TaskGraphResult<Option<GraphObject>> {
        let row = sqlx::query(&format!(
            "SELECT {GRAPH_COLUMNS} FROM graph_objects WHERE instance_id = ?"
        ))
        .bind(instance_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(TaskGraphError::Database)?;

        row.as_ref().map(Self::row_to_graph).transpose()
    }

    async fn query_graphs(&self, query: &GraphQuery) -> TaskGraphResult<Vec<GraphObject>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {GRAPH_COLUMNS} FROM graph_objects WHERE 1 = 1"
        ));
        if let Some(instance_id) = query.instance_id {
            qb.push(" AND instance_id = ").push_bind(instance_id.to_string());
        }
        if let Some(domain) = &query.domain {
            qb.push(" AND domain = ").push_bind(domain.clone());
        }
        if let Some(status) = query.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(target) = &query.context_target {
            qb.push(" AND context_target = ").push_bind(target.clone());
        }
        if let Some(service_graph) = query.service_graph {
            qb.push(" AND service_graph = ").push_bind(service_graph);
        }
        qb.push(" ORDER BY created_at, instance_id");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(TaskGraphError::Database)?;

        rows.iter().map(Self::row_to_graph).collect()
    }

    #[instrument(skip(self, mutation), fields(graph_id = %instance_id))]
    async fn try_update_graph(
        &self,
        instance_id: Uuid,
        precondition: &GraphPrecondition,
        mutation: &GraphMutation,
    ) -> TaskGraphResult<ConditionalUpdate<GraphObject>> {
        let tasks = mutation
            .tasks
            .as_ref()
            .map(MappingHelpers::to_json_text)
            .transpose()?;
        let context = mutation
            .context
            .as_ref()
            .map(MappingHelpers::to_json_text)
            .transpose()?;

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE graph_objects SET ");
        {
            let mut sets = qb.separated(", ");
            sets.push("rowrev = ")
                .push_bind_unseparated(Uuid::new_v4().to_string());
            sets.push("updated_at = ")
                .push_bind_unseparated(Utc::now().timestamp_millis());
            if let Some(tasks) = tasks {
                sets.push("tasks = ").push_bind_unseparated(tasks);
            }
            if let Some(context) = context {
                sets.push("context = ").push_bind_unseparated(context);
            }
            if let Some(status) = mutation.status {
                sets.push("status = ").push_bind_unseparated(status.as_str());
            }
        }
        qb.push(" WHERE instance_id = ")
            .push_bind(instance_id.to_string());
        match precondition {
            GraphPrecondition::Revision(rowrev) => {
                qb.push(" AND rowrev = ").push_bind(rowrev.clone());
            }
            GraphPrecondition::Status(status) => {
                qb.push(" AND status = ").push_bind(status.as_str());
            }
        }

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(TaskGraphError::Database)?;

        let current = self.read_graph(instance_id).await?;
        if result.rows_affected() == 1 {
            Ok(ConditionalUpdate {
                applied: true,
                current,
            })
        } else {
            Ok(ConditionalUpdate::rejected(current))
        }
    }

    async fn delete_graph(&self, instance_id: Uuid) -> TaskGraphResult<u64> {
        let result = sqlx::query("DELETE FROM graph_objects WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(TaskGraphError::Database)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, definition), fields(name = %definition.injectable_name))]
    async fn upsert_graph_definition(&self, definition: &GraphDefinition) -> TaskGraphResult<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO graph_definitions (injectable_name, friendly_name, tasks, service_graph, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT (injectable_name) DO UPDATE SET
                friendly_name = excluded.friendly_name,
                tasks = excluded.tasks,
                service_graph = excluded.service_graph,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&definition.injectable_name)
        .bind(&definition.friendly_name)
        .bind(MappingHelpers::to_json_text(&definition.tasks)?)
        .bind(definition.service_graph)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(TaskGraphError::Database)?;

        debug!("保存任务图定义成功");
        Ok(())
    }

    async fn query_graph_definitions(
        &self,
        injectable_name: Option<&str>,
    ) -> TaskGraphResult<Vec<GraphDefinition>> {
        let rows = match injectable_name {
            Some(name) => sqlx::query(
                "SELECT injectable_name, friendly_name, tasks, service_graph \
                 FROM graph_definitions WHERE injectable_name = ?",
            )
            .bind(name)
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(
                "SELECT injectable_name, friendly_name, tasks, service_graph \
                 FROM graph_definitions ORDER BY injectable_name",
            )
            .fetch_all(&self.pool)
            .await,
        }
        .map_err(TaskGraphError::Database)?;

        rows.iter().map(Self::row_to_definition).collect()
    }
}
