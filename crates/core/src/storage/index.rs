use crate::types::{Agent, App, Policy, Run, RunId, Step, StepId, Tool, Workflow, WorkflowId};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition, TableHandle};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const WORKFLOWS_TABLE: JsonTable = TableDefinition::new("workflows");
const TOOLS_TABLE: JsonTable = TableDefinition::new("tools");
const AGENTS_TABLE: JsonTable = TableDefinition::new("agents");
const POLICIES_TABLE: JsonTable = TableDefinition::new("policies");
const APPS_TABLE: JsonTable = TableDefinition::new("apps");
const RUNS_TABLE: JsonTable = TableDefinition::new("runs");
/// Keyed `<run_id>:<step_id>` so a run's steps are one contiguous range
const STEPS_TABLE: JsonTable = TableDefinition::new("steps");

const ALL_TABLES: [JsonTable; 7] = [
    WORKFLOWS_TABLE,
    TOOLS_TABLE,
    AGENTS_TABLE,
    POLICIES_TABLE,
    APPS_TABLE,
    RUNS_TABLE,
    STEPS_TABLE,
];

/// Index store for definitions and run state using redb
#[derive(Clone)]
pub struct RedbIndexStore {
    db: Arc<Database>,
}

impl RedbIndexStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Create every table up front so read transactions never hit a missing one
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        for table in ALL_TABLES {
            write_txn
                .open_table(table)
                .with_context(|| format!("Failed to open {} table", table.name()))?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn put<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .with_context(|| format!("Failed to serialize {} entry", table.name()))?;

        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn.open_table(table).context("Failed to open table")?;
            table
                .insert(key, bytes.as_slice())
                .context("Failed to insert entry")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> Result<Option<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        match table.get(key).context("Failed to get entry")? {
            Some(guard) => {
                let value =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize entry")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: JsonTable) -> Result<Vec<T>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(table).context("Failed to open table")?;

        let mut items = Vec::new();
        for item in table.iter().context("Failed to iterate table")? {
            let (_key, value) = item.context("Failed to read item")?;
            items.push(serde_json::from_slice(value.value()).context("Failed to deserialize entry")?);
        }
        Ok(items)
    }
}

fn step_key(run_id: &RunId, step_id: &StepId) -> String {
    format!("{}:{}", run_id, step_id)
}

/// Storage for definitions, runs and steps
pub trait IndexStore: Send + Sync {
    fn put_workflow(&self, workflow: &Workflow) -> Result<()>;
    fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<Workflow>>;
    fn list_workflows(&self) -> Result<Vec<Workflow>>;

    fn put_tool(&self, tool: &Tool) -> Result<()>;
    fn get_tool(&self, tool_id: &str) -> Result<Option<Tool>>;
    fn list_tools(&self) -> Result<Vec<Tool>>;

    fn put_agent(&self, agent: &Agent) -> Result<()>;
    fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>>;

    fn put_policy(&self, policy: &Policy) -> Result<()>;
    /// All policies in id order; callers filter by scope and `enabled`
    fn list_policies(&self) -> Result<Vec<Policy>>;

    fn put_app(&self, app: &App) -> Result<()>;
    fn get_app(&self, app_id: &str) -> Result<Option<App>>;

    /// Insert or replace a run row
    fn save_run(&self, run: &Run) -> Result<()>;
    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>>;
    /// Most recent first
    fn list_runs(&self) -> Result<Vec<Run>>;

    /// Insert or replace a step row
    fn save_step(&self, step: &Step) -> Result<()>;
    fn get_step(&self, run_id: &RunId, step_id: &StepId) -> Result<Option<Step>>;
    /// Steps of a run ordered by `started_at`
    fn list_steps(&self, run_id: &RunId) -> Result<Vec<Step>>;
}

impl IndexStore for RedbIndexStore {
    fn put_workflow(&self, workflow: &Workflow) -> Result<()> {
        self.put(WORKFLOWS_TABLE, &workflow.id.0, workflow)
    }

    fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<Workflow>> {
        self.get(WORKFLOWS_TABLE, &workflow_id.0)
    }

    fn list_workflows(&self) -> Result<Vec<Workflow>> {
        self.list(WORKFLOWS_TABLE)
    }

    fn put_tool(&self, tool: &Tool) -> Result<()> {
        self.put(TOOLS_TABLE, &tool.id, tool)
    }

    fn get_tool(&self, tool_id: &str) -> Result<Option<Tool>> {
        self.get(TOOLS_TABLE, tool_id)
    }

    fn list_tools(&self) -> Result<Vec<Tool>> {
        self.list(TOOLS_TABLE)
    }

    fn put_agent(&self, agent: &Agent) -> Result<()> {
        self.put(AGENTS_TABLE, &agent.id, agent)
    }

    fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>> {
        self.get(AGENTS_TABLE, agent_id)
    }

    fn put_policy(&self, policy: &Policy) -> Result<()> {
        self.put(POLICIES_TABLE, &policy.id.0, policy)
    }

    fn list_policies(&self) -> Result<Vec<Policy>> {
        self.list(POLICIES_TABLE)
    }

    fn put_app(&self, app: &App) -> Result<()> {
        self.put(APPS_TABLE, &app.id, app)
    }

    fn get_app(&self, app_id: &str) -> Result<Option<App>> {
        self.get(APPS_TABLE, app_id)
    }

    fn save_run(&self, run: &Run) -> Result<()> {
        self.put(RUNS_TABLE, &run.id.to_string(), run)
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        self.get(RUNS_TABLE, &run_id.to_string())
    }

    fn list_runs(&self) -> Result<Vec<Run>> {
        let mut runs: Vec<Run> = self.list(RUNS_TABLE)?;
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    fn save_step(&self, step: &Step) -> Result<()> {
        self.put(STEPS_TABLE, &step_key(&step.run_id, &step.id), step)
    }

    fn get_step(&self, run_id: &RunId, step_id: &StepId) -> Result<Option<Step>> {
        self.get(STEPS_TABLE, &step_key(run_id, step_id))
    }

    fn list_steps(&self, run_id: &RunId) -> Result<Vec<Step>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(STEPS_TABLE)
            .context("Failed to open steps table")?;

        // ';' sorts right after ':', closing the range over this run's keys
        let start = format!("{}:", run_id);
        let end = format!("{};", run_id);

        let mut steps = Vec::new();
        for item in table
            .range(start.as_str()..end.as_str())
            .context("Failed to scan steps")?
        {
            let (_key, value) = item.context("Failed to read step")?;
            let step: Step =
                serde_json::from_slice(value.value()).context("Failed to deserialize step")?;
            steps.push(step);
        }

        steps.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(steps)
    }
}
