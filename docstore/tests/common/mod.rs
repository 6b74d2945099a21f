#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use prost_types::value::Kind;
use prost_types::{Struct, Timestamp, Value};

use docstore::apiv1::model::{
    BatchGetRequest, BatchGetResponseItem, BatchGetResult, BatchWriteRequest, BatchWriteResponse,
    BeginTransactionRequest, BeginTransactionResponse, CommitRequest, CommitResponse, ConsistencySelector, Document,
    RollbackRequest,
};
use docstore::apiv1::{BatchGetStream, DocumentService};
use docstore::client::{Client, ClientConfig, PROJECT_ID_ENV};
use docstore::path::{DocumentPath, FieldPath};
use docstore::value::Fields;
use docstore::write::{Precondition, Write, WriteOp, WriteResult};
use docstore_gax::grpc::{Code, Status};

pub const PROJECT: &str = "local-project";
pub const DATABASE: &str = "(default)";

const BASE_SECONDS: i64 = 1_700_000_000;

/// Scripted in-process stand-in for the document service. Batch-get streams
/// responses in reverse request order to exercise reassembly.
#[derive(Default)]
pub struct MockService {
    pub state: Mutex<MockState>,
}

#[derive(Default)]
pub struct MockState {
    pub docs: BTreeMap<String, Fields>,
    pub update_times: BTreeMap<String, Timestamp>,
    clock: i64,
    next_token: u64,

    /// Whole-RPC batch-write failures, consumed per call.
    pub batch_write_errors: VecDeque<Code>,
    /// Per-document scripted write failures, consumed per attempt.
    pub write_errors: HashMap<String, VecDeque<Code>>,
    /// Commit failures, consumed per call.
    pub commit_errors: VecDeque<Code>,
    /// Per batch-get call: stream this many results, then fail.
    pub batch_get_errors: VecDeque<(usize, Code)>,

    pub batch_get_requests: Vec<Vec<String>>,
    pub batch_write_batches: Vec<Vec<String>>,
    pub commit_transactions: Vec<Option<Vec<u8>>>,
    pub begin_count: usize,
    pub rollback_count: usize,
}

impl MockService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, name: &str, fields: Fields) {
        let mut state = self.state.lock();
        state.docs.insert(name.to_string(), fields);
        state.update_times.insert(
            name.to_string(),
            Timestamp {
                seconds: BASE_SECONDS,
                nanos: 0,
            },
        );
    }

    pub fn doc_fields(&self, name: &str) -> Option<Fields> {
        self.state.lock().docs.get(name).cloned()
    }
}

impl MockState {
    fn next_time(&mut self) -> Timestamp {
        self.clock += 1;
        Timestamp {
            seconds: BASE_SECONDS + self.clock,
            nanos: 0,
        }
    }

    fn issue_token(&mut self) -> Vec<u8> {
        self.next_token += 1;
        self.next_token.to_be_bytes().to_vec()
    }

    fn apply_write(&mut self, write: &Write) -> Result<WriteResult, Status> {
        let name = write.path.to_string();
        let exists = self.docs.contains_key(&name);

        match &write.precondition {
            Some(Precondition::Exists(true)) if !exists => {
                return Err(Status::new(Code::NotFound, format!("no document to update: {name}")));
            }
            Some(Precondition::Exists(false)) if exists => {
                let code = match write.op {
                    WriteOp::Create { .. } => Code::AlreadyExists,
                    _ => Code::FailedPrecondition,
                };
                return Err(Status::new(code, format!("document already exists: {name}")));
            }
            Some(Precondition::UpdateTime(expected)) => match self.update_times.get(&name) {
                Some(actual) if actual == expected => {}
                _ => {
                    return Err(Status::new(
                        Code::FailedPrecondition,
                        format!("stale update time for {name}"),
                    ));
                }
            },
            _ => {}
        }

        match &write.op {
            WriteOp::Create { fields } | WriteOp::Set { fields, merge: None } => {
                self.docs.insert(name.clone(), fields.clone());
            }
            WriteOp::Set {
                fields,
                merge: Some(paths),
            } => {
                let mut target = self.docs.get(&name).cloned().unwrap_or_default();
                for path in paths {
                    match get_at(fields, path.segments()) {
                        Some(value) => set_at(&mut target, path.segments(), value),
                        None => remove_at(&mut target, path.segments()),
                    }
                }
                self.docs.insert(name.clone(), target);
            }
            WriteOp::Update { fields } => {
                let mut target = self.docs.get(&name).cloned().unwrap_or_default();
                for (path, value) in fields {
                    set_at(&mut target, path.segments(), value.clone());
                }
                self.docs.insert(name.clone(), target);
            }
            WriteOp::Delete => {
                self.docs.remove(&name);
                self.update_times.remove(&name);
                return Ok(WriteResult {
                    update_time: Some(self.next_time()),
                });
            }
        }
        let time = self.next_time();
        self.update_times.insert(name, time.clone());
        Ok(WriteResult {
            update_time: Some(time),
        })
    }
}

#[async_trait]
impl DocumentService for MockService {
    async fn batch_get_documents(&self, req: BatchGetRequest) -> Result<BatchGetStream, Status> {
        let mut state = self.state.lock();
        state.batch_get_requests.push(req.documents.clone());

        let token = match &req.consistency {
            Some(ConsistencySelector::NewTransaction(_)) => Some(state.issue_token()),
            _ => None,
        };
        let read_time = Timestamp {
            seconds: BASE_SECONDS + state.clock,
            nanos: 0,
        };

        // stream in reverse request order to force client-side reassembly
        let mut items: Vec<Result<BatchGetResponseItem, Status>> = req
            .documents
            .iter()
            .rev()
            .map(|name| {
                let result = match state.docs.get(name) {
                    Some(fields) => BatchGetResult::Found(Document {
                        name: name.clone(),
                        fields: fields.clone(),
                        create_time: None,
                        update_time: state.update_times.get(name).cloned(),
                    }),
                    None => BatchGetResult::Missing(name.clone()),
                };
                Ok(BatchGetResponseItem {
                    result,
                    read_time: Some(read_time.clone()),
                    transaction: None,
                })
            })
            .collect();

        if let Some((keep, code)) = state.batch_get_errors.pop_front() {
            items.truncate(keep);
            items.push(Err(Status::new(code, "scripted stream failure")));
        }
        if let Some(token) = token {
            if let Some(Ok(first)) = items.first_mut() {
                first.transaction = Some(token);
            }
        }

        Ok(stream::iter(items).boxed())
    }

    async fn begin_transaction(&self, _req: BeginTransactionRequest) -> Result<BeginTransactionResponse, Status> {
        let mut state = self.state.lock();
        state.begin_count += 1;
        let transaction = state.issue_token();
        Ok(BeginTransactionResponse { transaction })
    }

    async fn commit(&self, req: CommitRequest) -> Result<CommitResponse, Status> {
        let mut state = self.state.lock();
        state.commit_transactions.push(req.transaction.clone());
        if let Some(code) = state.commit_errors.pop_front() {
            return Err(Status::new(code, "scripted commit failure"));
        }
        let mut write_results = Vec::with_capacity(req.writes.len());
        for write in &req.writes {
            write_results.push(state.apply_write(write)?);
        }
        Ok(CommitResponse {
            commit_time: Some(state.next_time()),
            write_results,
        })
    }

    async fn rollback(&self, _req: RollbackRequest) -> Result<(), Status> {
        self.state.lock().rollback_count += 1;
        Ok(())
    }

    async fn batch_write(&self, req: BatchWriteRequest) -> Result<BatchWriteResponse, Status> {
        let mut state = self.state.lock();
        state
            .batch_write_batches
            .push(req.writes.iter().map(|w| w.path.to_string()).collect());
        if let Some(code) = state.batch_write_errors.pop_front() {
            return Err(Status::new(code, "scripted batch failure"));
        }
        let mut write_results = Vec::with_capacity(req.writes.len());
        let mut statuses = Vec::with_capacity(req.writes.len());
        for write in &req.writes {
            let name = write.path.to_string();
            if let Some(scripted) = state.write_errors.get_mut(&name).and_then(|q| q.pop_front()) {
                statuses.push(Status::new(scripted, "scripted write failure"));
                write_results.push(WriteResult { update_time: None });
                continue;
            }
            match state.apply_write(write) {
                Ok(result) => {
                    statuses.push(Status::new(Code::Ok, ""));
                    write_results.push(result);
                }
                Err(status) => {
                    statuses.push(status);
                    write_results.push(WriteResult { update_time: None });
                }
            }
        }
        Ok(BatchWriteResponse {
            write_results,
            statuses,
        })
    }
}

fn empty_struct() -> Value {
    Value {
        kind: Some(Kind::StructValue(Struct::default())),
    }
}

fn set_at(fields: &mut Fields, segments: &[String], value: Value) {
    if segments.len() == 1 {
        fields.insert(segments[0].clone(), value);
        return;
    }
    let child = fields.entry(segments[0].clone()).or_insert_with(empty_struct);
    if !matches!(child.kind, Some(Kind::StructValue(_))) {
        *child = empty_struct();
    }
    match &mut child.kind {
        Some(Kind::StructValue(nested)) => set_at(&mut nested.fields, &segments[1..], value),
        _ => unreachable!(),
    }
}

fn get_at(fields: &Fields, segments: &[String]) -> Option<Value> {
    let value = fields.get(&segments[0])?;
    if segments.len() == 1 {
        return Some(value.clone());
    }
    match &value.kind {
        Some(Kind::StructValue(nested)) => get_at(&nested.fields, &segments[1..]),
        _ => None,
    }
}

fn remove_at(fields: &mut Fields, segments: &[String]) {
    if segments.len() == 1 {
        fields.remove(&segments[0]);
        return;
    }
    if let Some(Value {
        kind: Some(Kind::StructValue(nested)),
    }) = fields.get_mut(&segments[0])
    {
        remove_at(&mut nested.fields, &segments[1..]);
    }
}

pub fn make_client(service: Arc<MockService>) -> Client {
    let environment: HashMap<String, String> = [(PROJECT_ID_ENV.to_string(), PROJECT.to_string())].into();
    let config = ClientConfig {
        environment: Some(environment),
        ..Default::default()
    };
    Client::new(service, config).unwrap()
}

pub fn doc(relative: &str) -> DocumentPath {
    DocumentPath::from_relative(PROJECT, DATABASE, relative).unwrap()
}

pub fn doc_name(relative: &str) -> String {
    doc(relative).to_string()
}

pub fn fp(raw: &str) -> FieldPath {
    FieldPath::parse(raw).unwrap()
}

pub fn number_of(fields: &Fields, name: &str) -> Option<f64> {
    match fields.get(name)?.kind.as_ref()? {
        Kind::NumberValue(n) => Some(*n),
        _ => None,
    }
}
