//! Sandbox host - runs the bundle's entry program in a V8 isolate.
//!
//! The isolate is `!Send`, so it lives on its own thread with a
//! current-thread Tokio runtime. HTTP handlers reach it through
//! [`RendererHandle`], which queues render jobs over a channel. Renders
//! interleave on that thread: the job queue and the V8 event loop are
//! polled together, so a render waiting on a timer or an outbound fetch
//! does not block the next request.
//!
//! The entry program only sees the globals listed in
//! [`CapabilityEnvironment`]: no fs, net (beyond the fetch allowlist),
//! env, or process access.

use std::cell::Cell;
use std::future::poll_fn;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Poll;

use async_trait::async_trait;
use deno_core::{serde_v8, v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use deno_permissions::PermissionsContainer;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::bundle::{Bundle, ENTRY_PATH};
use crate::capabilities::CapabilityEnvironment;
use crate::error::FabError;
use crate::loader::{BundleLoader, ENTRY_SPECIFIER};
use crate::ops::{fab_sandbox, FetchConfig, RenderOutcome, RenderQueue, RenderRequest, RenderedResponse};
use crate::renderer::{default_settings, Renderer, RendererInfo};

static FAB_SNAPSHOT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/FAB_SNAPSHOT.bin"));

/// Configuration for the sandbox
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Allowed origins for fetch() (empty = fetch disabled)
    pub allowed_origins: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_heap_size: Some(64 * 1024 * 1024),
            allowed_origins: vec![],
        }
    }
}

/// Create a sandboxed JS runtime from the startup snapshot.
pub fn create_runtime(bundle: Arc<Bundle>, config: &SandboxConfig) -> JsRuntime {
    let create_params = config
        .max_heap_size
        .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

    let blob_store = Arc::new(deno_web::BlobStore::default());

    let mut runtime = JsRuntime::new(RuntimeOptions {
        module_loader: Some(Rc::new(BundleLoader::new(bundle))),
        startup_snapshot: Some(FAB_SNAPSHOT),
        extensions: vec![
            deno_webidl::deno_webidl::init_ops(),
            deno_console::deno_console::init_ops(),
            deno_url::deno_url::init_ops(),
            deno_web::deno_web::init_ops::<PermissionsContainer>(blob_store, None),
            fab_sandbox::init_ops(),
        ],
        create_params,
        ..Default::default()
    });

    {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(FetchConfig {
            allowed_origins: config.allowed_origins.clone(),
        });
        state.put(RenderQueue::default());
        state.put(HeapGuard::default());
    }

    if config.max_heap_size.is_some() {
        arm_heap_guard(&mut runtime);
    }

    runtime
}

/// Set by the near-heap-limit callback once it has terminated execution.
#[derive(Default, Clone)]
struct HeapGuard {
    tripped: Rc<Cell<bool>>,
}

/// Terminate running JS instead of letting V8 abort the process on OOM.
///
/// The limit is raised so the terminated script can unwind;
/// [`recover_from_heap_exhaustion`] puts it back.
fn arm_heap_guard(runtime: &mut JsRuntime) {
    let guard = runtime.op_state().borrow().borrow::<HeapGuard>().clone();
    let isolate = runtime.v8_isolate().thread_safe_handle();
    runtime.add_near_heap_limit_callback(move |current, initial| {
        warn!(
            current_mb = current / (1024 * 1024),
            initial_mb = initial / (1024 * 1024),
            "Sandbox near heap limit, terminating execution"
        );
        guard.tripped.set(true);
        isolate.terminate_execution();
        current * 2
    });
}

/// After a heap-limit termination: fail whatever was in flight, clear the
/// termination and restore the original limit.
fn recover_from_heap_exhaustion(runtime: &mut JsRuntime, max_heap_size: Option<usize>) {
    let Some(max_bytes) = max_heap_size else {
        return;
    };
    let tripped = runtime
        .op_state()
        .borrow()
        .borrow::<HeapGuard>()
        .tripped
        .replace(false);
    if !tripped {
        return;
    }

    let failed = runtime
        .op_state()
        .borrow_mut()
        .borrow_mut::<RenderQueue>()
        .fail_all("Sandbox heap limit exceeded");
    error!(failed, "Sandbox hit its heap limit; in-flight renders failed");

    runtime.v8_isolate().cancel_terminate_execution();
    runtime.remove_near_heap_limit_callback(max_bytes);
    arm_heap_guard(runtime);
}

/// Run the entry program once and check what it exported.
fn load_renderer(runtime: &mut JsRuntime, source: String) -> Result<RendererInfo, FabError> {
    let prepare = CapabilityEnvironment::build()
        .prepare_script()
        .map_err(|e| FabError::renderer_load(format!("Failed to encode capabilities: {e}")))?;
    runtime
        .execute_script("<fab:prepare>", prepare)
        .map_err(|e| FabError::renderer_load(format!("Failed to prepare sandbox: {e}")))?;

    runtime
        .execute_script(ENTRY_SPECIFIER, source)
        .map_err(|e| FabError::renderer_load(format!("{ENTRY_PATH} threw: {e}")))?;

    let install = format!(
        "globalThis.__fab_install({})",
        serde_json::to_string(&default_settings())
            .map_err(|e| FabError::renderer_load(e.to_string()))?
    );
    let info = runtime
        .execute_script("<fab:install>", install)
        .map_err(|e| FabError::renderer_load(e.to_string()))?;

    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, &info);
    let info = serde_v8::from_v8::<RendererInfo>(scope, local)
        .map_err(|e| FabError::renderer_load(format!("Unexpected install result: {e}")))?;
    Ok(info)
}

struct RenderJob {
    request: RenderRequest,
    reply: oneshot::Sender<RenderOutcome>,
}

enum Step {
    Job(Option<RenderJob>),
    Idle,
    Failed(deno_core::error::AnyError),
}

fn dispatch(runtime: &mut JsRuntime, job: RenderJob) {
    let id = runtime
        .op_state()
        .borrow_mut()
        .borrow_mut::<RenderQueue>()
        .admit(job.request, job.reply);

    if let Err(e) = runtime.execute_script("<fab:dispatch>", format!("globalThis.__fab_dispatch({id})")) {
        runtime
            .op_state()
            .borrow_mut()
            .borrow_mut::<RenderQueue>()
            .settle(id, Err(e.to_string()));
    }
}

async fn serve_jobs(
    runtime: &mut JsRuntime,
    max_heap_size: Option<usize>,
    mut jobs: mpsc::UnboundedReceiver<RenderJob>,
) {
    loop {
        let step = poll_fn(|cx| {
            let event_loop = runtime.poll_event_loop(cx, PollEventLoopOptions::default());
            if let Poll::Ready(Err(e)) = event_loop {
                return Poll::Ready(Step::Failed(e));
            }
            match jobs.poll_recv(cx) {
                Poll::Ready(job) => Poll::Ready(Step::Job(job)),
                Poll::Pending => event_loop.map(|_| Step::Idle),
            }
        })
        .await;

        let job = match step {
            Step::Job(job) => job,
            Step::Idle => jobs.recv().await,
            Step::Failed(e) => {
                // An uncaught error from bundle code outside any render.
                // deno_core drops the rest of that tick, so pending timers
                // may be gone and the renders waiting on them never settle.
                let failed = runtime
                    .op_state()
                    .borrow_mut()
                    .borrow_mut::<RenderQueue>()
                    .fail_all(&format!("Uncaught error in sandbox: {e}"));
                error!(error = %e, failed, "Uncaught error in sandbox");
                recover_from_heap_exhaustion(runtime, max_heap_size);
                continue;
            }
        };

        match job {
            Some(job) => {
                dispatch(runtime, job);
                recover_from_heap_exhaustion(runtime, max_heap_size);
            }
            None => break,
        }
    }
}

fn run_isolate(
    bundle: Arc<Bundle>,
    config: SandboxConfig,
    source: String,
    ready: oneshot::Sender<Result<RendererInfo, FabError>>,
    jobs: mpsc::UnboundedReceiver<RenderJob>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(FabError::renderer_load(format!(
                "Failed to build sandbox runtime: {e}"
            ))));
            return;
        }
    };

    rt.block_on(async move {
        let mut runtime = create_runtime(bundle, &config);
        match load_renderer(&mut runtime, source) {
            Ok(info) => {
                if ready.send(Ok(info)).is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        }
        serve_jobs(&mut runtime, config.max_heap_size, jobs).await;
    });

    debug!("Sandbox thread exiting");
}

/// Starts the sandbox. Called once per process.
pub struct SandboxHost;

impl SandboxHost {
    /// Execute the bundle's `/server.js` and return a handle to its renderer.
    ///
    /// Fails with [`FabError::RendererLoad`] if the program throws or does
    /// not export `render`.
    pub async fn start(bundle: Arc<Bundle>, config: SandboxConfig) -> Result<RendererHandle, FabError> {
        let source = bundle.entry_source()?.to_string();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("fab-sandbox".into())
            .spawn(move || run_isolate(bundle, config, source, ready_tx, jobs_rx))
            .map_err(|e| FabError::renderer_load(format!("Failed to spawn sandbox thread: {e}")))?;

        let info = ready_rx
            .await
            .map_err(|_| FabError::renderer_load("Sandbox thread exited during startup"))??;

        info!(
            has_prod_settings = info.has_prod_settings,
            "Renderer loaded"
        );

        Ok(RendererHandle { jobs: jobs_tx, info })
    }
}

/// Cloneable handle to the renderer living on the sandbox thread.
///
/// The sandbox runs until every handle has been dropped.
#[derive(Clone)]
pub struct RendererHandle {
    jobs: mpsc::UnboundedSender<RenderJob>,
    info: RendererInfo,
}

impl RendererHandle {
    pub fn info(&self) -> RendererInfo {
        self.info
    }
}

#[async_trait]
impl Renderer for RendererHandle {
    async fn render(&self, request: RenderRequest) -> Result<RenderedResponse, FabError> {
        let (reply, outcome) = oneshot::channel();
        self.jobs
            .send(RenderJob { request, reply })
            .map_err(|_| FabError::render("Sandbox is no longer running"))?;

        match outcome.await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(reason)) => Err(FabError::render(reason)),
            Err(_) => Err(FabError::render("Sandbox dropped the request")),
        }
    }
}
