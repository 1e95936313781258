use stampede_proto::rpc::ResponseStatus;
use stampede_proto::{Sequence, WriteId};

/// Discriminant shared by tasks and their results; selects the
/// consistency level and timeout for one client operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskKind {
    Get,
    Put,
    Delete,
    List,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Get => write!(f, "GET"),
            TaskKind::Put => write!(f, "PUT"),
            TaskKind::Delete => write!(f, "DELETE"),
            TaskKind::List => write!(f, "LIST"),
        }
    }
}

/// One client operation before it is routed to the replica set.
#[derive(Clone, Debug)]
pub enum StoreTask {
    Get {
        filename: String,
        version: usize,
    },
    Put {
        filename: String,
        data: Vec<u8>,
        write_id: WriteId,
    },
    Delete {
        filename: String,
    },
    List {
        filename: String,
    },
}

impl StoreTask {
    pub fn kind(&self) -> TaskKind {
        match self {
            StoreTask::Get { .. } => TaskKind::Get,
            StoreTask::Put { .. } => TaskKind::Put,
            StoreTask::Delete { .. } => TaskKind::Delete,
            StoreTask::List { .. } => TaskKind::List,
        }
    }

    pub fn filename(&self) -> &str {
        match self {
            StoreTask::Get { filename, .. }
            | StoreTask::Put { filename, .. }
            | StoreTask::Delete { filename }
            | StoreTask::List { filename } => filename,
        }
    }
}

/// One replica's answer, or the reconciled quorum outcome.
#[derive(Clone, Debug)]
pub enum StoreTaskResult {
    Get {
        status: ResponseStatus,
        seq: Option<Sequence>,
        data: Vec<u8>,
    },
    Put {
        status: ResponseStatus,
    },
    Delete {
        status: ResponseStatus,
    },
    List {
        status: ResponseStatus,
        hosts: Vec<String>,
    },
}

impl StoreTaskResult {
    pub fn kind(&self) -> TaskKind {
        match self {
            StoreTaskResult::Get { .. } => TaskKind::Get,
            StoreTaskResult::Put { .. } => TaskKind::Put,
            StoreTaskResult::Delete { .. } => TaskKind::Delete,
            StoreTaskResult::List { .. } => TaskKind::List,
        }
    }

    pub fn status(&self) -> ResponseStatus {
        match self {
            StoreTaskResult::Get { status, .. }
            | StoreTaskResult::Put { status }
            | StoreTaskResult::Delete { status }
            | StoreTaskResult::List { status, .. } => *status,
        }
    }
}
