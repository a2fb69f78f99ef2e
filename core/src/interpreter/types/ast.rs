//! Lowered IR node types
//!
//! The front end hands the engine a [`Program`]: flows made of statements,
//! record schemas, pure functions, tools, pipelines and AI profiles. The IR is
//! immutable once a run starts.

use super::schema::RecordSchema;
use super::values::Val;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/* ===================== Statements ===================== */

/// Statement with its source location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stmt {
    #[serde(flatten)]
    pub kind: StmtKind,

    #[serde(default)]
    pub line: u32,

    #[serde(default)]
    pub column: u32,
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Self {
            kind,
            line: 0,
            column: 0,
        }
    }

    pub fn at(mut self, line: u32, column: u32) -> Self {
        self.line = line;
        self.column = column;
        self
    }
}

/// Statement AST node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum StmtKind {
    Let {
        name: String,
        value: Expr,
        #[serde(default)]
        constant: bool,
    },
    Set {
        target: SetTarget,
        value: Expr,
    },
    If {
        test: Expr,
        then_body: Vec<Stmt>,
        #[serde(default)]
        else_body: Vec<Stmt>,
    },
    ForEach {
        name: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Repeat {
        count: Expr,
        body: Vec<Stmt>,
    },
    /// Loop while `test` is truthy, at most `limit` iterations
    RepeatWhile {
        test: Expr,
        body: Vec<Stmt>,
        #[serde(default)]
        limit: Option<u64>,
    },
    Match {
        subject: Expr,
        cases: Vec<MatchCase>,
        #[serde(default)]
        otherwise: Vec<Stmt>,
    },
    TryCatch {
        try_body: Vec<Stmt>,
        catch_var: String,
        #[serde(default)]
        catch_body: Vec<Stmt>,
    },
    Return {
        #[serde(default)]
        value: Option<Expr>,
    },
    Evaluate {
        expr: Expr,
    },
    Create {
        record: String,
        values: Expr,
        #[serde(default)]
        target: Option<String>,
    },
    Save {
        record: String,
        values: Expr,
        #[serde(default)]
        target: Option<String>,
    },
    Update {
        record: String,
        predicate: Predicate,
        changes: Vec<FieldAssign>,
        #[serde(default)]
        target: Option<String>,
    },
    Delete {
        record: String,
        predicate: Predicate,
        #[serde(default)]
        target: Option<String>,
    },
    Find {
        record: String,
        #[serde(default)]
        predicate: Option<Predicate>,
        target: String,
    },
    Metric {
        name: String,
        value: Expr,
        #[serde(default)]
        labels: BTreeMap<String, String>,
    },
    Log {
        #[serde(default)]
        level: LogLevel,
        message: Expr,
    },
    Parallel {
        branches: Vec<Branch>,
        #[serde(default)]
        merge: Option<MergeSpec>,
        #[serde(default)]
        target: Option<String>,
    },
    AsyncLaunch {
        name: String,
        call: Expr,
    },
    AsyncAwait {
        name: String,
        #[serde(default)]
        target: Option<String>,
    },
}

impl StmtKind {
    /// Stable statement kind name used in steps and error locations
    pub fn name(&self) -> &'static str {
        match self {
            StmtKind::Let { .. } => "let",
            StmtKind::Set { .. } => "set",
            StmtKind::If { .. } => "if",
            StmtKind::ForEach { .. } => "for_each",
            StmtKind::Repeat { .. } => "repeat",
            StmtKind::RepeatWhile { .. } => "repeat_while",
            StmtKind::Match { .. } => "match",
            StmtKind::TryCatch { .. } => "try",
            StmtKind::Return { .. } => "return",
            StmtKind::Evaluate { .. } => "evaluate",
            StmtKind::Create { .. } => "create",
            StmtKind::Save { .. } => "save",
            StmtKind::Update { .. } => "update",
            StmtKind::Delete { .. } => "delete",
            StmtKind::Find { .. } => "find",
            StmtKind::Metric { .. } => "metric",
            StmtKind::Log { .. } => "log",
            StmtKind::Parallel { .. } => "parallel",
            StmtKind::AsyncLaunch { .. } => "async_launch",
            StmtKind::AsyncAwait { .. } => "async_await",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum SetTarget {
    Var { name: String },
    State { path: Vec<String> },
}

/// One `when` arm; runs when `pattern` equals the match subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCase {
    pub pattern: Expr,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldAssign {
    pub field: String,
    pub value: Expr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/* ===================== Parallel Blocks ===================== */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSpec {
    pub policy: MergePolicy,
    #[serde(default)]
    pub precedence: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Successful branches must agree; disagreement is an error
    Conflict,
    /// First successful branch in the declared precedence order
    Precedence,
    /// Later successful branches override earlier ones
    Override,
    FirstOk,
    AllOk,
    Collect,
}

impl MergePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            MergePolicy::Conflict => "conflict",
            MergePolicy::Precedence => "precedence",
            MergePolicy::Override => "override",
            MergePolicy::FirstOk => "first_ok",
            MergePolicy::AllOk => "all_ok",
            MergePolicy::Collect => "collect",
        }
    }
}

/* ===================== Expressions ===================== */

/// Expression AST node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Expr {
    Lit {
        v: Val,
    },
    Var {
        name: String,
    },
    Attr {
        base: String,
        path: Vec<String>,
    },
    State {
        path: Vec<String>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CmpOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    List {
        items: Vec<Expr>,
    },
    Map {
        entries: Vec<MapEntry>,
    },
    CallTool {
        name: String,
        #[serde(default)]
        args: Vec<MapEntry>,
    },
    CallAi {
        profile: String,
        input: Box<Expr>,
    },
    CallFlow {
        name: String,
        #[serde(default)]
        args: Vec<MapEntry>,
    },
    CallPipeline {
        name: String,
        input: Box<Expr>,
    },
    CallFunction {
        name: String,
        #[serde(default)]
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn lit(v: impl Into<Val>) -> Self {
        Expr::Lit { v: v.into() }
    }

    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var { name: name.into() }
    }

    /// Calls are the only expressions an async task may launch
    pub fn is_call(&self) -> bool {
        matches!(
            self,
            Expr::CallTool { .. }
                | Expr::CallAi { .. }
                | Expr::CallFlow { .. }
                | Expr::CallPipeline { .. }
                | Expr::CallFunction { .. }
        )
    }

    /// Whether the expression reads the `mutation` binding
    pub fn mentions_mutation(&self) -> bool {
        match self {
            Expr::Var { name } => name == "mutation",
            Expr::Attr { base, .. } => base == "mutation",
            Expr::Unary { operand, .. } => operand.mentions_mutation(),
            Expr::Binary { left, right, .. } | Expr::Compare { left, right, .. } => {
                left.mentions_mutation() || right.mentions_mutation()
            }
            Expr::List { items } | Expr::CallFunction { args: items, .. } => {
                items.iter().any(Expr::mentions_mutation)
            }
            Expr::Map { entries } | Expr::CallTool { args: entries, .. } | Expr::CallFlow { args: entries, .. } => {
                entries.iter().any(|e| e.value.mentions_mutation())
            }
            Expr::CallAi { input, .. } | Expr::CallPipeline { input, .. } => input.mentions_mutation(),
            Expr::Lit { .. } | Expr::State { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapEntry {
    pub key: String,
    pub value: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryOp {
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn sql(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    pub fn is_ordering(self) -> bool {
        !matches!(self, CmpOp::Eq | CmpOp::Ne)
    }
}

/* ===================== Predicates ===================== */

/// Declarative `where` clause as written in the source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Predicate {
    Compare {
        /// Dotted field path; more than one segment reaches into a json field
        field: String,
        op: CmpOp,
        value: Expr,
    },
    Contains {
        field: String,
        value: Expr,
    },
    And {
        items: Vec<Predicate>,
    },
    Or {
        items: Vec<Predicate>,
    },
    Not {
        inner: Box<Predicate>,
    },
}

/* ===================== Declarations ===================== */

/// Named side effect that passes through the capability gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    FilesystemRead,
    FilesystemWrite,
    Network,
    Subprocess,
    EnvRead,
    Secrets,
    Mutation,
}

impl Effect {
    pub const ALL: [Effect; 7] = [
        Effect::FilesystemRead,
        Effect::FilesystemWrite,
        Effect::Network,
        Effect::Subprocess,
        Effect::EnvRead,
        Effect::Secrets,
        Effect::Mutation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Effect::FilesystemRead => "filesystem_read",
            Effect::FilesystemWrite => "filesystem_write",
            Effect::Network => "network",
            Effect::Subprocess => "subprocess",
            Effect::EnvRead => "env_read",
            Effect::Secrets => "secrets",
            Effect::Mutation => "mutation",
        }
    }

    /// Name of the guarantee that forbids this effect, e.g. `no_network`
    pub fn guarantee(self) -> String {
        format!("no_{}", self.as_str())
    }

    pub fn from_guarantee(name: &str) -> Option<Effect> {
        let effect = name.strip_prefix("no_")?;
        Effect::ALL.into_iter().find(|e| e.as_str() == effect)
    }

    pub fn is_filesystem(self) -> bool {
        matches!(self, Effect::FilesystemRead | Effect::FilesystemWrite)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub name: String,
    pub body: Vec<Stmt>,
    #[serde(default)]
    pub requires: Option<Expr>,
    #[serde(default)]
    pub audited: bool,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

/// Pure function: no record access, no tools, no AI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDecl {
    pub name: String,
    /// Effects the tool performs; each is checked before the call
    #[serde(default)]
    pub capabilities: Vec<Effect>,
    /// Installed pack that provides the tool
    #[serde(default)]
    pub pack: Option<String>,
}

/// Ordered chain of tools; each step receives the previous step's output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDecl {
    pub name: String,
    pub steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiProfile {
    pub name: String,
    #[serde(default = "default_ai_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_ai_provider() -> String {
    "mock".to_string()
}

/// Lowered program handed to the engine by the front end
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub flows: Vec<Flow>,
    #[serde(default)]
    pub records: Vec<RecordSchema>,
    #[serde(default)]
    pub functions: Vec<FunctionDecl>,
    #[serde(default)]
    pub tools: Vec<ToolDecl>,
    #[serde(default)]
    pub pipelines: Vec<PipelineDecl>,
    #[serde(default)]
    pub ai_profiles: Vec<AiProfile>,
}

impl Program {
    pub fn flow(&self, name: &str) -> Option<&Flow> {
        self.flows.iter().find(|f| f.name == name)
    }

    pub fn record(&self, name: &str) -> Option<&RecordSchema> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDecl> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDecl> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn pipeline(&self, name: &str) -> Option<&PipelineDecl> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    pub fn ai_profile(&self, name: &str) -> Option<&AiProfile> {
        self.ai_profiles.iter().find(|p| p.name == name)
    }
}
