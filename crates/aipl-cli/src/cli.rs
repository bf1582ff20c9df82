use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "aipl", version)]
#[command(about = "AIPL: automated coding-task execution engine")]
pub struct Cli {
    /// Engine root directory (defaults to CWD)
    #[arg(long, global = true)]
    pub root: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Plan a backlog from a natural-language objective
    Plan {
        /// The objective to plan for
        #[arg(long)]
        task: String,

        #[arg(long)]
        plan_id: Option<String>,

        #[arg(long)]
        workspace: Option<String>,

        /// Background goal text (defaults to goal.txt if present)
        #[arg(long)]
        goal: Option<String>,

        #[arg(long, default_value_t = 8)]
        max_tasks: usize,
    },

    /// Execute the next runnable task
    Run {
        #[arg(long)]
        plan_id: Option<String>,

        #[arg(long)]
        workspace: Option<String>,

        /// autopilot (assistant-driven) or manual
        #[arg(long, default_value = "autopilot")]
        mode: String,

        #[arg(long, default_value_t = 3)]
        max_rounds: usize,
    },

    /// Plan then execute every runnable task of the plan
    RunPlan {
        #[arg(long)]
        task: String,

        #[arg(long)]
        plan_id: Option<String>,

        #[arg(long)]
        workspace: Option<String>,

        #[arg(long, default_value = "autopilot")]
        mode: String,

        #[arg(long, default_value_t = 3)]
        max_rounds: usize,

        /// Snapshot and remove the plan's tasks from the backlog afterwards
        #[arg(long)]
        cleanup: bool,
    },

    /// Status snapshot for a plan or a single run
    Status {
        #[arg(long)]
        plan_id: Option<String>,

        #[arg(long)]
        run_id: Option<String>,
    },

    /// Read a run's event log with cursor pagination
    Events {
        #[arg(long)]
        plan_id: Option<String>,

        #[arg(long)]
        run_id: String,

        #[arg(long, default_value_t = 0)]
        cursor: usize,

        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// List a run's artifact files
    Artifacts {
        #[arg(long)]
        plan_id: Option<String>,

        #[arg(long)]
        run_id: String,
    },

    /// Request cancellation of a run
    Cancel {
        #[arg(long)]
        plan_id: Option<String>,

        #[arg(long)]
        run_id: String,
    },

    /// Pause a running run
    Pause {
        #[arg(long)]
        plan_id: Option<String>,

        #[arg(long)]
        run_id: String,
    },

    /// Resume a paused run
    Resume {
        #[arg(long)]
        plan_id: Option<String>,

        #[arg(long)]
        run_id: String,
    },

    /// Cancel every active run of a plan
    CancelPlanRuns {
        #[arg(long)]
        plan_id: String,
    },

    /// Reset a failed run's task back to todo
    Retry {
        #[arg(long)]
        plan_id: Option<String>,

        #[arg(long)]
        run_id: String,

        /// Also reset the task's dependency subgraph
        #[arg(long)]
        retry_deps: bool,
    },

    /// Apply a reviewed patch set into the main workspace
    Apply {
        #[arg(long)]
        plan_id: Option<String>,

        #[arg(long)]
        run_id: String,
    },

    /// Discard a run's pending change set
    Discard {
        #[arg(long)]
        plan_id: Option<String>,

        #[arg(long)]
        run_id: String,
    },

    /// Schedule one extra round on the same stage with feedback
    Rework {
        #[arg(long)]
        plan_id: Option<String>,

        #[arg(long)]
        run_id: String,

        #[arg(long, default_value = "")]
        feedback: String,

        #[arg(long)]
        step_id: Option<String>,
    },

    /// Inspect or update a workspace profile
    Profile {
        #[command(subcommand)]
        cmd: ProfileCommands,
    },

    /// Manage workspace context rules
    Rules {
        #[command(subcommand)]
        cmd: RulesCommands,
    },

    /// Manage workspace extra checks
    Checks {
        #[command(subcommand)]
        cmd: ChecksCommands,
    },

    /// Manage learned lessons
    Lessons {
        #[command(subcommand)]
        cmd: LessonsCommands,
    },

    /// Build or query the code graph
    CodeGraph {
        #[command(subcommand)]
        cmd: CodeGraphCommands,
    },

    /// Print a bounded workspace tree listing
    WorkspaceTree {
        #[arg(long)]
        workspace: String,

        #[arg(long, default_value_t = 3)]
        depth: usize,
    },

    /// Read one workspace file
    WorkspaceRead {
        #[arg(long)]
        workspace: String,

        #[arg(long)]
        path: String,
    },

    /// Manage experience packs
    ExperiencePacks {
        #[command(subcommand)]
        cmd: PackCommands,
    },

    /// Manage language packs
    LanguagePacks {
        #[command(subcommand)]
        cmd: PackCommands,
    },

    /// One-shot free-form assistant exchange
    AssistantChat {
        #[arg(long)]
        prompt: String,

        #[arg(long)]
        workspace: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ProfileCommands {
    Get {
        #[arg(long)]
        workspace: String,
    },
    Update {
        #[arg(long)]
        workspace: String,

        /// Propose a fresh soft draft
        #[arg(long)]
        propose_soft: bool,

        /// Approve the parked soft draft
        #[arg(long, conflicts_with = "reject_soft")]
        approve_soft: bool,

        /// Reject the parked soft draft
        #[arg(long)]
        reject_soft: bool,
    },
}

#[derive(Subcommand)]
pub enum RulesCommands {
    Add {
        #[arg(long)]
        workspace: String,

        #[arg(long, default_value = "fix")]
        scope: String,

        #[arg(long)]
        content: String,
    },
    Delete {
        #[arg(long)]
        workspace: String,

        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ChecksCommands {
    Add {
        #[arg(long)]
        workspace: String,

        #[arg(long, default_value = "fix")]
        scope: String,

        /// Check definition as JSON
        #[arg(long)]
        check: String,
    },
    Delete {
        #[arg(long)]
        workspace: String,

        #[arg(long)]
        id: String,
    },
}

#[derive(Subcommand)]
pub enum LessonsCommands {
    Delete {
        #[arg(long)]
        workspace: String,

        /// Delete lessons whose content contains this text
        #[arg(long)]
        contains: String,
    },
    Clear {
        #[arg(long)]
        workspace: String,
    },
}

#[derive(Subcommand)]
pub enum CodeGraphCommands {
    Build {
        #[arg(long)]
        workspace: String,

        /// Write the graph JSON here (defaults to stdout summary only)
        #[arg(long)]
        output: Option<String>,
    },
    Related {
        #[arg(long)]
        workspace: String,

        #[arg(long)]
        file: Vec<String>,

        #[arg(long, default_value_t = 2)]
        hops: usize,
    },
}

#[derive(Subcommand)]
pub enum PackCommands {
    List,
    Get {
        #[arg(long)]
        name: String,
    },
    /// Import a pack file into the engine's pack library
    Import {
        #[arg(long)]
        file: String,
    },
    /// Copy a library pack into a workspace's imported packs
    ImportWorkspace {
        #[arg(long)]
        name: String,

        #[arg(long)]
        workspace: String,
    },
    Export {
        #[arg(long)]
        name: String,

        #[arg(long)]
        output: String,
    },
    Delete {
        #[arg(long)]
        name: String,
    },
    /// Replace a library pack from a file
    Update {
        #[arg(long)]
        name: String,

        #[arg(long)]
        file: String,
    },
}
