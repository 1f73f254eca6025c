use async_trait::async_trait;
use chrono::Utc;
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};
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
        task_id UUID PRIMARY KEY,
        graph_id UUID NOT NULL,
        domain TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'pending',
        reachable BOOLEAN NOT NULL DEFAULT TRUE,
        evaluated BOOLEAN NOT NULL DEFAULT FALSE,
        dependencies JSONB NOT NULL DEFAULT '{}'::jsonb,
        terminal_on_states JSONB NOT NULL DEFAULT '[]'::jsonb,
        lease_owner TEXT NOT NULL DEFAULT '',
        lease_heartbeat TIMESTAMPTZ NOT NULL,
        context JSONB,
        rowrev TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS graph_objects (
        instance_id UUID PRIMARY KEY,
        name TEXT NOT NULL,
        definition JSONB NOT NULL,
        tasks JSONB NOT NULL DEFAULT '{}'::jsonb,
        context JSONB NOT NULL DEFAULT '{}'::jsonb,
        status TEXT NOT NULL DEFAULT 'pending',
        domain TEXT NOT NULL,
        context_target TEXT NOT NULL DEFAULT '',
        service_graph BOOLEAN NOT NULL DEFAULT FALSE,
        rowrev TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS graph_definitions (
        injectable_name TEXT PRIMARY KEY,
        friendly_name TEXT NOT NULL,
        tasks JSONB NOT NULL,
        service_graph BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_dependencies_graph ON task_dependencies(graph_id)",
    "CREATE INDEX IF NOT EXISTS idx_task_dependencies_ready ON task_dependencies(domain, state, reachable)",
    "CREATE INDEX IF NOT EXISTS idx_task_dependencies_lease ON task_dependencies(lease_owner, lease_heartbeat)",
    "CREATE INDEX IF NOT EXISTS idx_task_dependencies_evaluated ON task_dependencies(evaluated, state)",
    "CREATE INDEX IF NOT EXISTS idx_graph_objects_status ON graph_objects(status, domain)",
    "CREATE INDEX IF NOT EXISTS idx_graph_objects_target ON graph_objects(context_target)",
];

/// PostgreSQL 存储后端
///
/// 条件更新是一条带前置条件的 `UPDATE … RETURNING`，一次往返完成
/// find-and-modify；没有返回行时再读取当前行交给调用方判断。
pub struct PostgresStoreBackend {
    pool: PgPool,
}

impl PostgresStoreBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_task(row: &PgRow) -> TaskGraphResult<TaskDependency> {
        let state: String = row.try_get("state")?;
        Ok(TaskDependency {
            task_id: row.try_get("task_id")?,
            graph_id: row.try_get("graph_id")?,
            domain: row.try_get("domain")?,
            state: state.parse()?,
            reachable: row.try_get("reachable")?,
            evaluated: row.try_get("evaluated")?,
            dependencies: MappingHelpers::parse_json_postgres(row, "dependencies")?,
            terminal_on_states: MappingHelpers::parse_json_postgres(row, "terminal_on_states")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_heartbeat: row.try_get("lease_heartbeat")?,
            context: row.try_get("context")?,
            rowrev: row.try_get("rowrev")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_graph(row: &PgRow) -> TaskGraphResult<GraphObject> {
        let status: String = row.try_get("status")?;
        Ok(GraphObject {
            instance_id: row.try_get("instance_id")?,
            name: row.try_get("name")?,
            definition: row.try_get("definition")?,
            tasks: MappingHelpers::parse_json_postgres(row, "tasks")?,
            context: MappingHelpers::parse_json_postgres(row, "context")?,
            status: status.parse()?,
            domain: row.try_get("domain")?,
            context_target: row.try_get("context_target")?,
            service_graph: row.try_get("service_graph")?,
            rowrev: row.try_get("rowrev")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_definition(row: &PgRow) -> TaskGraphResult<GraphDefinition> {
        Ok(GraphDefinition {
            injectable_name: row.try_get("injectable_name")?,
            friendly_name: row.try_get("friendly_name")?,
            tasks: MappingHelpers::parse_json_postgres(row, "tasks")?,
            service_graph: row.try_get("service_graph")?,
        })
    }

    fn push_task_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &TaskQuery) {
        qb.push(" WHERE TRUE");
        if let Some(graph_id) = query.graph_id {
            qb.push(" AND graph_id = ").push_bind(graph_id);
        }
        if let Some(domain) = &query.domain {
            qb.push(" AND domain = ").push_bind(domain.clone());
        }
        if let Some(states) = &query.states {
            if states.is_empty() {
                qb.push(" AND FALSE");
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
            qb.push(" AND lease_heartbeat < ").push_bind(before);
        }
        if query.no_outstanding_dependencies {
            qb.push(" AND dependencies = '{}'::jsonb");
        }
        if let Some(upstream) = query.depends_on {
            qb.push(" AND dependencies ? ").push_bind(upstream.to_string());
        }
        qb.push(" ORDER BY created_at, task_id");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
    }

    fn push_task_mutation(qb: &mut QueryBuilder<'_, Postgres>, mutation: &TaskMutation) {
        let now = Utc::now();
        let mut sets = qb.separated(", ");
        sets.push("rowrev = ")
            .push_bind_unseparated(Uuid::new_v4().to_string());
        sets.push("updated_at = ").push_bind_unseparated(now);
        if let Some(state) = mutation.state {
            sets.push("state = ").push_bind_unseparated(state.as_str());
        }
        if let Some(context) = &mutation.context {
            sets.push("context = ").push_bind_unseparated(context.clone());
        }
        if let Some(dependencies) = &mutation.dependencies {
            sets.push("dependencies = ")
                .push_bind_unseparated(sqlx::types::Json(dependencies.clone()));
        }
        if mutation.mark_unreachable {
            sets.push("reachable = FALSE");
        }
        if mutation.mark_evaluated {
            sets.push("evaluated = TRUE");
        }
        match &mutation.lease {
            Some(LeaseUpdate::Acquire { owner, heartbeat }) => {
                sets.push("lease_owner = ").push_bind_unseparated(owner.clone());
                sets.push("lease_heartbeat = ").push_bind_unseparated(*heartbeat);
            }
            Some(LeaseUpdate::Renew { heartbeat }) => {
                sets.push("lease_heartbeat = ").push_bind_unseparated(*heartbeat);
            }
            Some(LeaseUpdate::Release) => {
                sets.push("lease_owner = ''");
            }
            None => {}
        }
    }

    fn push_task_precondition(qb: &mut QueryBuilder<'_, Postgres>, precondition: &TaskPrecondition) {
        match precondition {
            TaskPrecondition::Revision(rowrev) => {
                qb.push(" AND rowrev = ").push_bind(rowrev.clone());
            }
            TaskPrecondition::LeaseOwner(owner) => {
                qb.push(" AND lease_owner = ").push_bind(owner.clone());
            }
            TaskPrecondition::LeaseClaim(claim) => {
                qb.push(" AND lease_owner = ").push_bind(claim.owner.clone());
                qb.push(" AND lease_heartbeat = ").push_bind(claim.heartbeat);
            }
            TaskPrecondition::Claimable => {
                qb.push(" AND lease_owner = '' AND reachable = TRUE AND state = ")
                    .push_bind(TaskState::Pending.as_str());
            }
        }
    }
}

#[async_trait]
impl StoreBackend for PostgresStoreBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    #[instrument(skip(self))]
    async fn migrate(&self) -> TaskGraphResult<()> {
        debug!("运行PostgreSQL数据库迁移");
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(TaskGraphError::Database)?;
        }
        debug!("PostgreSQL数据库迁移完成");
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(task.task_id)
        .bind(task.graph_id)
        .bind(&task.domain)
        .bind(task.state.as_str())
        .bind(task.reachable)
        .bind(task.evaluated)
        .bind(sqlx::types::Json(&task.dependencies))
        .bind(sqlx::types::Json(&task.terminal_on_states))
        .bind(&task.lease_owner)
        .bind(task.lease_heartbeat)
        .bind(&task.context)
        .bind(&task.rowrev)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(TaskGraphError::Database)?;

        debug!("插入任务依赖记录成功");
        Ok(())
    }

    async fn read_task(&self, task_id: Uuid) -> TaskGraphResult<Option<TaskDependency>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM task_dependencies WHERE task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(TaskGraphError::Database)?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn query_tasks(&self, query: &TaskQuery) -> TaskGraphResult<Vec<TaskDependency>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
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
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE task_dependencies SET ");
        Self::push_task_mutation(&mut qb, mutation);
        qb.push(" WHERE task_id = ").push_bind(task_id);
        Self::push_task_precondition(&mut qb, precondition);
        qb.push(format!(" RETURNING {TASK_COLUMNS}"));

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(TaskGraphError::Database)?;

        match row {
            Some(row) => Ok(ConditionalUpdate::applied(Self::row_to_task(&row)?)),
            None => {
                debug!("条件更新未生效: {:?}", precondition);
                Ok(ConditionalUpdate::rejected(self.read_task(task_id).await?))
            }
        }
    }

    async fn delete_tasks(&self, task_ids: &[Uuid]) -> TaskGraphResult<u64> {
        if task_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM task_dependencies WHERE task_id = ANY($1)")
            .bind(task_ids.to_vec())
            .execute(&self.pool)
            .await
            .map_err(TaskGraphError::Database)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, graph), fields(graph_id = %graph.instance_id))]
    async fn insert_graph(&self, graph: &GraphObject) -> TaskGraphResult<()> {
        sqlx::query(&format!(
            "INSERT INTO graph_objects ({GRAPH_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(graph.instance_id)
        .bind(&graph.name)
        .bind(&graph.definition)
        .bind(sqlx::types::Json(&graph.tasks))
        .bind(sqlx::types::Json(&graph.context))
        .bind(graph.status.as_str())
        .bind(&graph.domain)
        .bind(&graph.context_target)
        .bind(graph.service_graph)
        .bind(&graph.rowrev)
        .bind(graph.created_at)
        .bind(graph.updated_at)
        .execute(&self.pool)
        .await
        .map_err(TaskGraphError::Database)?;

        debug!("插入任务图记录成功");
        Ok(())
    }

    async fn read_graph(&self, instance_id: Uuid) -> TaskGraphResult<Option<GraphObject>> {
        let row = sqlx::query(&format!(
            "SELECT {GRAPH_COLUMNS} FROM graph_objects WHERE instance_id = $1"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(TaskGraphError::Database)?;

        row.as_ref().map(Self::row_to_graph).transpose()
    }

    async fn query_graphs(&self, query: &GraphQuery) -> TaskGraphResult<Vec<GraphObject>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {GRAPH_COLUMNS} FROM graph_objects WHERE TRUE"
        ));
        if let Some(instance_id) = query.instance_id {
            qb.push(" AND instance_id = ").push_bind(instance_id);
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
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE graph_objects SET ");
        {
            let mut sets = qb.separated(", ");
            sets.push("rowrev = ")
                .push_bind_unseparated(Uuid::new_v4().to_string());
            sets.push("updated_at = ").push_bind_unseparated(Utc::now());
            if let Some(tasks) = &mutation.tasks {
                sets.push("tasks = ")
                    .push_bind_unseparated(sqlx::types::Json(tasks.clone()));
            }
            if let Some(context) = &mutation.context {
                sets.push("context = ")
                    .push_bind_unseparated(sqlx::types::Json(context.clone()));
            }
            if let Some(status) = mutation.status {
                sets.push("status = ").push_bind_unseparated(status.as_str());
            }
        }
        qb.push(" WHERE instance_id = ").push_bind(instance_id);
        match precondition {
            GraphPrecondition::Revision(rowrev) => {
                qb.push(" AND rowrev = ").push_bind(rowrev.clone());
            }
            GraphPrecondition::Status(status) => {
                qb.push(" AND status = ").push_bind(status.as_str());
            }
        }
        qb.push(format!(" RETURNING {GRAPH_COLUMNS}"));

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(TaskGraphError::Database)?;

        match row {
            Some(row) => Ok(ConditionalUpdate::applied(Self::row_to_graph(&row)?)),
            None => Ok(ConditionalUpdate::rejected(self.read_graph(instance_id).await?)),
        }
    }

    async fn delete_graph(&self, instance_id: Uuid) -> TaskGraphResult<u64> {
        let result = sqlx::query("DELETE FROM graph_objects WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(TaskGraphError::Database)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, definition), fields(name = %definition.injectable_name))]
    async fn upsert_graph_definition(&self, definition: &GraphDefinition) -> TaskGraphResult<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO graph_definitions (injectable_name, friendly_name, tasks, service_graph, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (injectable_name) DO UPDATE SET
                friendly_name = EXCLUDED.friendly_name,
                tasks = EXCLUDED.tasks,
                service_graph = EXCLUDED.service_graph,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&definition.injectable_name)
        .bind(&definition.friendly_name)
        .bind(sqlx::types::Json(&definition.tasks))
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
                 FROM graph_definitions WHERE injectable_name = $1",
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

