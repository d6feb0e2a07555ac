// SPDX-License-Identifier: GPL-3.0-only

//! Lifecycle orchestrator.
//!
//! Requests are authorized, turned into a tracked job and handed to a spawned
//! task; the caller gets the job id back at once. Terminal results are
//! published on the event channel by the task that ran the job.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use encrypt_types::{
    ChangePassphraseRequest, DecryptRequest, EncryptEvent, EncryptRequest, ErrorKind, JobId,
    JobOutcome, JobResult,
};
use tokio::sync::{Mutex, broadcast, watch};

use crate::auth::{Action, Authority};
use crate::context::JobContext;
use crate::engine::{JobStore, TableMaintainer, token};
use crate::jobs::{self, Prepared, ResumeWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    PrepareEncrypt,
    Decrypt,
    ChangePassphrase,
    ResumeEncrypt,
}

/// Lifecycle of a job. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Running,
    Finished(JobResult),
}

#[derive(Debug, Clone)]
struct JobRecord {
    kind: JobKind,
    device: String,
    state: JobState,
}

/// The process-wide resume worker, while it exists.
///
/// `waiting` is set by the worker only while it polls for parameters of a
/// resumable device; requests are routed into `mailbox` only then.
struct ResumeHandle {
    job_id: String,
    device: String,
    mailbox: watch::Sender<Option<EncryptRequest>>,
    waiting: Arc<AtomicBool>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, JobRecord>,
    /// Devices with a job in flight.
    busy: HashSet<String>,
    resume: Option<ResumeHandle>,
}

impl State {
    /// Registers a job on `device` unless another one holds it. Records of
    /// finished jobs are dropped here.
    fn admit(&mut self, kind: JobKind, device: &str) -> Option<String> {
        if !self.busy.insert(device.to_string()) {
            return None;
        }
        self.jobs
            .retain(|_, record| !matches!(record.state, JobState::Finished(_)));
        let id = JobId::new().to_string();
        self.jobs.insert(
            id.clone(),
            JobRecord {
                kind,
                device: device.to_string(),
                state: JobState::Created,
            },
        );
        Some(id)
    }

    fn set_state(&mut self, id: &str, state: JobState) {
        if let Some(record) = self.jobs.get_mut(id) {
            tracing::debug!("{} {:?} on {}: {:?}", id, record.kind, record.device, state);
            record.state = state;
            if let JobState::Finished(_) = state {
                self.busy.remove(&record.device);
            }
        }
    }
}

pub struct EncryptManager {
    ctx: Arc<JobContext>,
    authority: Arc<dyn Authority>,
    state: Arc<Mutex<State>>,
}

impl EncryptManager {
    pub fn new(ctx: JobContext, authority: Arc<dyn Authority>) -> Self {
        Self {
            ctx: Arc::new(ctx),
            authority,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn context(&self) -> &Arc<JobContext> {
        &self.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EncryptEvent> {
        self.ctx.events.subscribe()
    }

    pub async fn job_state(&self, job_id: &str) -> Option<JobState> {
        self.state.lock().await.jobs.get(job_id).map(|r| r.state)
    }

    /// Spawns the crypttab sweep and, if a job record is pending, the resume
    /// worker.
    pub async fn start(&self) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if let Err(kind) = TableMaintainer::new(&ctx).reconcile().await {
                tracing::warn!("Crypttab reconciliation failed ({})", kind);
            }
        });

        let Some(job) = JobStore::new(&self.ctx.config).read_encrypt() else {
            return;
        };
        let device = job.device_path.clone();
        let device_name = job.device_name.clone();

        let mut state = self.state.lock().await;
        if state.resume.is_some() {
            tracing::warn!("Resume worker already started");
            return;
        }
        let Some(job_id) = state.admit(JobKind::ResumeEncrypt, &device) else {
            tracing::warn!("{}: busy, not resuming", device);
            return;
        };
        let (mailbox, params) = watch::channel(None);
        let waiting = Arc::new(AtomicBool::new(false));
        state.resume = Some(ResumeHandle {
            job_id: job_id.clone(),
            device: device.clone(),
            mailbox,
            waiting: waiting.clone(),
        });
        state.set_state(&job_id, JobState::Running);
        drop(state);

        tracing::info!("{}: pending encryption found, starting resume worker", device);
        let worker = ResumeWorker::new(self.ctx.clone(), job, params, waiting);
        let ctx = self.ctx.clone();
        let shared = self.state.clone();
        tokio::spawn(async move {
            let outcome = worker.run().await;
            let mut state = shared.lock().await;
            // A caller whose parameters were routed here holds this job id
            // and is owed a result even when the worker gave up.
            let routed = state
                .resume
                .as_ref()
                .is_some_and(|resume| resume.mailbox.borrow().is_some());
            let result = match outcome {
                Some(result) => Some(result),
                None if routed => Some(JobResult::failed(ErrorKind::Unknown)),
                None => None,
            };
            if let Some(result) = result {
                ctx.publish(EncryptEvent::EncryptResult(JobOutcome {
                    device: device.clone(),
                    device_name,
                    job_id: job_id.clone(),
                    result,
                }));
            }
            state.set_state(&job_id, JobState::Finished(result.unwrap_or(JobResult::SUCCESS)));
            state.resume = None;
        });
    }

    pub async fn prepare_encrypt(&self, caller: &str, req: EncryptRequest) -> String {
        if !self.authority.is_authorized(caller, Action::Encrypt).await {
            self.reject(EncryptEvent::PrepareEncryptResult, &req.device, &req.device_name, ErrorKind::UserCancelled);
            return String::new();
        }

        let mut state = self.state.lock().await;
        if let Some(resume) = &state.resume
            && resume.device == req.device
            && !req.passphrase.is_empty()
            && resume.waiting.load(Ordering::SeqCst)
        {
            tracing::info!("{}: parameters routed to the pending resume job", req.device);
            let job_id = resume.job_id.clone();
            resume.mailbox.send_replace(Some(req));
            return job_id;
        }
        let Some(job_id) = state.admit(JobKind::PrepareEncrypt, &req.device) else {
            drop(state);
            tracing::warn!("{}: busy, prepare rejected", req.device);
            self.reject(EncryptEvent::PrepareEncryptResult, &req.device, &req.device_name, ErrorKind::DeviceBusy);
            return String::new();
        };
        drop(state);

        tracing::info!("{}: prepare encrypt job {} accepted", req.device, job_id);
        let ctx = self.ctx.clone();
        let shared = self.state.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            shared.lock().await.set_state(&id, JobState::Running);
            let outcome = |result: JobResult| JobOutcome {
                device: req.device.clone(),
                device_name: req.device_name.clone(),
                job_id: id.clone(),
                result,
            };

            let result = match jobs::prepare::run(&ctx, &req).await {
                Ok(Prepared::Ready(slots)) => {
                    tracing::info!("{}: starting encryption", req.device);
                    let result = JobResult::from(jobs::reencrypt::run(&ctx, &req, slots).await);
                    ctx.publish(EncryptEvent::EncryptResult(outcome(result)));
                    result
                }
                Ok(Prepared::Deferred) => {
                    let result = JobResult::failed(ErrorKind::RebootRequired);
                    ctx.publish(EncryptEvent::PrepareEncryptResult(outcome(result)));
                    result
                }
                Err(kind) => {
                    let result = JobResult::failed(kind);
                    ctx.publish(EncryptEvent::PrepareEncryptResult(outcome(result)));
                    result
                }
            };
            shared.lock().await.set_state(&id, JobState::Finished(result));
        });
        job_id
    }

    pub async fn decrypt(&self, caller: &str, req: DecryptRequest) -> String {
        if !self.authority.is_authorized(caller, Action::Decrypt).await {
            self.reject(EncryptEvent::DecryptResult, &req.device, &req.device_name, ErrorKind::UserCancelled);
            return String::new();
        }
        if req.device.is_empty() || (req.passphrase.is_empty() && !req.init_params_only) {
            tracing::warn!("Decrypt request without device or passphrase ignored");
            return String::new();
        }

        let Some(job_id) = self.state.lock().await.admit(JobKind::Decrypt, &req.device) else {
            tracing::warn!("{}: busy, decrypt rejected", req.device);
            self.reject(EncryptEvent::DecryptResult, &req.device, &req.device_name, ErrorKind::DeviceBusy);
            return String::new();
        };

        tracing::info!("{}: decrypt job {} accepted", req.device, job_id);
        let ctx = self.ctx.clone();
        let shared = self.state.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            shared.lock().await.set_state(&id, JobState::Running);
            let result = JobResult::from(jobs::decrypt::run(&ctx, &req).await);
            ctx.publish(EncryptEvent::DecryptResult(JobOutcome {
                device: req.device.clone(),
                device_name: req.device_name.clone(),
                job_id: id.clone(),
                result,
            }));
            shared.lock().await.set_state(&id, JobState::Finished(result));
        });
        job_id
    }

    pub async fn change_passphrase(&self, caller: &str, req: ChangePassphraseRequest) -> String {
        if !self.authority.is_authorized(caller, Action::ChangePassphrase).await {
            self.reject(EncryptEvent::ChangePassphraseResult, &req.device, &req.device_name, ErrorKind::UserCancelled);
            return String::new();
        }

        let Some(job_id) = self
            .state
            .lock()
            .await
            .admit(JobKind::ChangePassphrase, &req.device)
        else {
            tracing::warn!("{}: busy, passphrase change rejected", req.device);
            self.reject(EncryptEvent::ChangePassphraseResult, &req.device, &req.device_name, ErrorKind::DeviceBusy);
            return String::new();
        };

        tracing::info!("{}: change passphrase job {} accepted", req.device, job_id);
        let ctx = self.ctx.clone();
        let shared = self.state.clone();
        let id = job_id.clone();
        tokio::spawn(async move {
            shared.lock().await.set_state(&id, JobState::Running);
            let result = JobResult::from(jobs::passphrase::run(&ctx, &req).await);
            ctx.publish(EncryptEvent::ChangePassphraseResult(JobOutcome {
                device: req.device.clone(),
                device_name: req.device_name.clone(),
                job_id: id.clone(),
                result,
            }));
            shared.lock().await.set_state(&id, JobState::Finished(result));
        });
        job_id
    }

    pub async fn query_token(&self, device: &str) -> String {
        token::query_token(&self.ctx, device).await
    }

    /// Feeds parameters to the waiting resume worker.
    pub async fn set_deferred_params(&self, caller: &str, req: EncryptRequest) {
        if !self.authority.is_authorized(caller, Action::Encrypt).await {
            self.reject(EncryptEvent::PrepareEncryptResult, &req.device, &req.device_name, ErrorKind::UserCancelled);
            return;
        }
        let state = self.state.lock().await;
        match &state.resume {
            Some(resume) => {
                tracing::info!("{}: parameters supplied to resume job", req.device);
                resume.mailbox.send_replace(Some(req));
            }
            None => tracing::info!("No pending resume job, parameters dropped"),
        }
    }

    /// Publishes a rejection that never became a job.
    fn reject(
        &self,
        event: fn(JobOutcome) -> EncryptEvent,
        device: &str,
        device_name: &str,
        kind: ErrorKind,
    ) {
        self.ctx.publish(event(JobOutcome {
            device: device.to_string(),
            device_name: device_name.to_string(),
            job_id: String::new(),
            result: JobResult::failed(kind),
        }));
    }
}
