use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::events::RunEvent;
use crate::export::brand_prefix;
use crate::images::InlineImage;
use crate::prompt::{build_instruction, AdFields, AspectRatio, PromptContext, Template};
use crate::providers::{AdImageGenerator, AdImageRequest};

pub const DEFAULT_PACING_MS: u64 = 1500;

/// One user-triggered batch: shared context plus the ratio selection to
/// expand. The product and logo are encoded exactly once, here, and reused
/// read-only by every task.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub fields: AdFields,
    pub template: Template,
    pub brand_color: String,
    pub watermark: bool,
    pub ratios: Vec<AspectRatio>,
    pub batch_size: u32,
    pub product: InlineImage,
    pub logo: Option<InlineImage>,
}

impl BatchRequest {
    pub fn validate(&self) -> Result<(), String> {
        let mut problems = Vec::new();
        if self.fields.headline.trim().is_empty() {
            problems.push("headline must not be empty");
        }
        if self.ratios.is_empty() {
            problems.push("at least one aspect ratio must be selected");
        }
        if self.batch_size == 0 {
            problems.push("batch size must be at least 1");
        }
        if self.product.is_empty() {
            problems.push("a product image is required");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }

    /// Task order is repetition-major: the full ratio selection, in
    /// selection order, repeated `batch_size` times.
    pub fn expand(&self) -> Vec<AspectRatio> {
        let mut tasks = Vec::with_capacity(self.ratios.len() * self.batch_size as usize);
        for _ in 0..self.batch_size {
            tasks.extend(self.ratios.iter().copied());
        }
        tasks
    }

    pub fn total_tasks(&self) -> u64 {
        self.batch_size as u64 * self.ratios.len() as u64
    }
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub id: Uuid,
    pub image: InlineImage,
    pub ratio: AspectRatio,
}

/// (tasks dispatched so far, total tasks). Zeroed whenever no batch is in
/// flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub dispatched: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_busy(&self) -> bool {
        matches!(self, RunState::Running)
    }
}

/// Mutable per-session generation state. Only the orchestrator writes it
/// while a batch runs; readers take short lock scopes for snapshots.
#[derive(Debug, Default)]
pub struct Session {
    pub state: RunState,
    pub run_id: Option<String>,
    pub brand_prefix: String,
    pub results: Vec<GenerationResult>,
    pub progress: BatchProgress,
    pub error: Option<String>,
}

impl Session {
    fn begin_run(&mut self, run_id: String, total: u64, prefix: String) -> Result<(), StartError> {
        if self.state.is_busy() {
            return Err(StartError::Busy);
        }
        self.state = RunState::Running;
        self.run_id = Some(run_id);
        self.brand_prefix = prefix;
        self.results.clear();
        self.error = None;
        self.progress = BatchProgress { dispatched: 0, total };
        Ok(())
    }

    fn complete(&mut self) {
        self.state = RunState::Completed;
        self.error = None;
        self.progress = BatchProgress::default();
    }

    // Results produced before the failure stay downloadable.
    fn fail(&mut self, message: String) {
        self.state = RunState::Failed;
        self.error = Some(message);
        self.progress = BatchProgress::default();
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchParams {
    pub pacing: Duration,
}

impl Default for BatchParams {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(DEFAULT_PACING_MS),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("{0}")]
    Invalid(String),
    #[error("a batch is already running")]
    Busy,
}

#[derive(Debug)]
pub struct BatchHandle {
    pub run_id: String,
    pub total: u64,
    pub task: JoinHandle<()>,
}

fn emit(events: &Option<broadcast::Sender<RunEvent>>, event: RunEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Validate, claim the session, and spawn the sequential batch loop.
/// The claim happens synchronously under the session lock, so two callers
/// can never both enter `Running`.
pub fn start_batch(
    provider: Arc<dyn AdImageGenerator>,
    session: Arc<Mutex<Session>>,
    request: BatchRequest,
    params: BatchParams,
    events: Option<broadcast::Sender<RunEvent>>,
) -> Result<BatchHandle, StartError> {
    request.validate().map_err(StartError::Invalid)?;

    let run_id = format!("run-{}", Uuid::new_v4());
    let total = request.total_tasks();
    let prefix = brand_prefix(&request.fields.headline);
    session.lock().begin_run(run_id.clone(), total, prefix)?;
    emit(&events, RunEvent::Started { run_id: run_id.clone(), total });

    let task = tokio::spawn(drive(
        provider,
        session,
        request,
        params,
        events,
        run_id.clone(),
    ));

    Ok(BatchHandle { run_id, total, task })
}

/// The batch loop proper. Strictly sequential: one generation call in
/// flight, a fixed pacing sleep between tasks (never after the last), halt
/// on first failure keeping everything produced so far. Task failures are
/// recorded in the session, never propagated as a panic or silent skip.
async fn drive(
    provider: Arc<dyn AdImageGenerator>,
    session: Arc<Mutex<Session>>,
    request: BatchRequest,
    params: BatchParams,
    events: Option<broadcast::Sender<RunEvent>>,
    run_id: String,
) {
    let tasks = request.expand();
    let total = tasks.len() as u64;

    for (idx, ratio) in tasks.into_iter().enumerate() {
        let dispatched = idx as u64 + 1;
        session.lock().progress = BatchProgress { dispatched, total };
        emit(
            &events,
            RunEvent::Progress {
                run_id: run_id.clone(),
                dispatched,
                total,
            },
        );
        tracing::info!(
            run_id = %run_id,
            task = dispatched,
            total,
            ratio = %ratio,
            provider = provider.name(),
            "dispatching generation task"
        );

        let instruction = build_instruction(&PromptContext {
            template: request.template,
            fields: &request.fields,
            brand_color: &request.brand_color,
            watermark: request.watermark,
            ratio,
            has_logo: request.logo.is_some(),
        });
        let call = AdImageRequest {
            product: &request.product,
            logo: request.logo.as_ref(),
            instruction: &instruction,
            ratio,
        };

        match provider.generate(&call).await {
            Ok(image) => {
                let id = Uuid::new_v4();
                let seq = {
                    let mut s = session.lock();
                    s.results.push(GenerationResult { id, image, ratio });
                    s.results.len() as u64
                };
                emit(
                    &events,
                    RunEvent::ResultReady {
                        run_id: run_id.clone(),
                        result_id: id.to_string(),
                        ratio: ratio.as_str().to_string(),
                        seq,
                    },
                );
            }
            Err(e) => {
                let message = e.user_message();
                tracing::warn!(
                    run_id = %run_id,
                    task = dispatched,
                    error = %message,
                    "generation task failed; halting batch"
                );
                session.lock().fail(message.clone());
                emit(
                    &events,
                    RunEvent::Failed {
                        run_id: run_id.clone(),
                        error: message,
                    },
                );
                return;
            }
        }

        if dispatched < total {
            tokio::time::sleep(params.pacing).await;
        }
    }

    session.lock().complete();
    emit(
        &events,
        RunEvent::Finished {
            run_id: run_id.clone(),
            produced: total,
        },
    );
    tracing::info!(run_id = %run_id, produced = total, "batch completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderError;
    use async_trait::async_trait;

    struct ScriptedProvider {
        calls: Mutex<Vec<AspectRatio>>,
        fail_at: Option<usize>,
    }

    impl ScriptedProvider {
        fn ok() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_at: None,
            }
        }

        fn failing_at(n: usize) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_at: Some(n),
            }
        }
    }

    #[async_trait]
    impl AdImageGenerator for ScriptedProvider {
        async fn generate(
            &self,
            req: &AdImageRequest<'_>,
        ) -> Result<InlineImage, ProviderError> {
            let call_no = {
                let mut calls = self.calls.lock();
                calls.push(req.ratio);
                calls.len()
            };
            if self.fail_at == Some(call_no) {
                return Err(ProviderError::Api {
                    status: 429,
                    message: "Resource has been exhausted (check quota)".into(),
                });
            }
            Ok(InlineImage {
                mime_type: "image/png".into(),
                data: "aGVsbG8=".into(),
            })
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn request(ratios: Vec<AspectRatio>, batch_size: u32) -> BatchRequest {
        BatchRequest {
            fields: AdFields {
                headline: "Fresh Deal".into(),
                ..AdFields::default()
            },
            template: Template::Hero,
            brand_color: "#1d4ed8".into(),
            watermark: false,
            ratios,
            batch_size,
            product: InlineImage {
                mime_type: "image/png".into(),
                data: "aW1n".into(),
            },
            logo: None,
        }
    }

    fn zero_pacing() -> BatchParams {
        BatchParams {
            pacing: Duration::ZERO,
        }
    }

    #[test]
    fn expansion_is_repetition_major_in_selection_order() {
        let req = request(vec![AspectRatio::Square, AspectRatio::Landscape], 3);
        assert_eq!(req.total_tasks(), 6);
        assert_eq!(
            req.expand(),
            vec![
                AspectRatio::Square,
                AspectRatio::Landscape,
                AspectRatio::Square,
                AspectRatio::Landscape,
                AspectRatio::Square,
                AspectRatio::Landscape,
            ]
        );
    }

    #[test]
    fn validation_rejects_incomplete_input() {
        let mut req = request(vec![AspectRatio::Square], 1);
        req.fields.headline = "  ".into();
        assert!(req.validate().unwrap_err().contains("headline"));

        let mut req = request(vec![], 1);
        req.fields.headline = "ok".into();
        assert!(req.validate().unwrap_err().contains("aspect ratio"));

        let req = request(vec![AspectRatio::Square], 0);
        assert!(req.validate().unwrap_err().contains("batch size"));

        let mut req = request(vec![AspectRatio::Square], 1);
        req.product.data.clear();
        assert!(req.validate().unwrap_err().contains("product image"));
    }

    #[tokio::test]
    async fn full_batch_preserves_dispatch_order_and_resets_progress() {
        let provider = Arc::new(ScriptedProvider::ok());
        let session = Arc::new(Mutex::new(Session::default()));
        let req = request(vec![AspectRatio::Square, AspectRatio::Landscape], 2);

        let handle = start_batch(
            provider.clone(),
            session.clone(),
            req,
            zero_pacing(),
            None,
        )
        .unwrap();
        assert_eq!(handle.total, 4);
        handle.task.await.unwrap();

        let expected = vec![
            AspectRatio::Square,
            AspectRatio::Landscape,
            AspectRatio::Square,
            AspectRatio::Landscape,
        ];
        assert_eq!(*provider.calls.lock(), expected);

        let s = session.lock();
        assert_eq!(s.state, RunState::Completed);
        assert_eq!(s.progress, BatchProgress::default());
        assert!(s.error.is_none());
        let result_ratios: Vec<AspectRatio> = s.results.iter().map(|r| r.ratio).collect();
        assert_eq!(result_ratios, expected);
    }

    #[tokio::test]
    async fn failure_halts_the_batch_and_keeps_prior_results() {
        let provider = Arc::new(ScriptedProvider::failing_at(3));
        let session = Arc::new(Mutex::new(Session::default()));
        let req = request(vec![AspectRatio::Square, AspectRatio::Story], 3);

        let handle = start_batch(
            provider.clone(),
            session.clone(),
            req,
            zero_pacing(),
            None,
        )
        .unwrap();
        handle.task.await.unwrap();

        // Task 3 failed, so exactly tasks 1..=3 were dispatched and 2 results kept.
        assert_eq!(provider.calls.lock().len(), 3);
        let s = session.lock();
        assert_eq!(s.state, RunState::Failed);
        assert_eq!(s.results.len(), 2);
        assert_eq!(s.progress, BatchProgress::default());
        let err = s.error.as_deref().unwrap();
        assert!(err.contains("reduce the batch size"), "quota error should be rewritten: {err}");
    }

    #[tokio::test]
    async fn concurrent_start_is_rejected_while_running() {
        let session = Arc::new(Mutex::new(Session::default()));
        session
            .lock()
            .begin_run("run-x".into(), 1, "ad".into())
            .unwrap();

        let err = start_batch(
            Arc::new(ScriptedProvider::ok()),
            session.clone(),
            request(vec![AspectRatio::Square], 1),
            zero_pacing(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, StartError::Busy));
    }

    #[tokio::test]
    async fn new_batch_clears_previous_error_and_results() {
        let session = Arc::new(Mutex::new(Session::default()));

        let failing = Arc::new(ScriptedProvider::failing_at(1));
        start_batch(
            failing,
            session.clone(),
            request(vec![AspectRatio::Square], 1),
            zero_pacing(),
            None,
        )
        .unwrap()
        .task
        .await
        .unwrap();
        assert!(session.lock().error.is_some());

        let ok = Arc::new(ScriptedProvider::ok());
        start_batch(
            ok,
            session.clone(),
            request(vec![AspectRatio::Portrait], 2),
            zero_pacing(),
            None,
        )
        .unwrap()
        .task
        .await
        .unwrap();

        let s = session.lock();
        assert_eq!(s.state, RunState::Completed);
        assert!(s.error.is_none());
        assert_eq!(s.results.len(), 2);
    }

    #[tokio::test]
    async fn events_report_dispatch_before_result() {
        let (tx, mut rx) = broadcast::channel(64);
        let session = Arc::new(Mutex::new(Session::default()));
        let handle = start_batch(
            Arc::new(ScriptedProvider::ok()),
            session.clone(),
            request(vec![AspectRatio::Square], 2),
            zero_pacing(),
            Some(tx),
        )
        .unwrap();
        handle.task.await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(evt) = rx.try_recv() {
            kinds.push(match evt {
                RunEvent::Started { .. } => "started",
                RunEvent::Progress { .. } => "progress",
                RunEvent::ResultReady { .. } => "result",
                RunEvent::Finished { .. } => "finished",
                RunEvent::Failed { .. } => "failed",
            });
        }
        assert_eq!(
            kinds,
            vec!["started", "progress", "result", "progress", "result", "finished"]
        );
    }
}
