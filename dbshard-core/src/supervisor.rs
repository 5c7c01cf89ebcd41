//! Panic isolation for background work.
//!
//! Every liveness probe runs for the lifetime of its handle, so a panic in one
//! probe must never take the process down with it. Work run through this
//! module has its panics caught, rendered with a stack trace and logged at
//! DEBUG level.
//!
//! Stack traces are recorded by a process-wide panic hook, installed on first
//! use and chained in front of whatever hook was there before. The hook only
//! records (and stays silent) while the panicking thread is inside a
//! supervised scope; every other panic is forwarded to the previous hook.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::pin;
use std::sync::Once;
use std::task::Poll;

use tokio::task::JoinHandle;
use tracing::debug;

/// Most frames kept in a report.
pub const MAX_STACK: usize = 20;

/// Banner framing every rendered report.
pub const SEPARATOR: &str = "---------------------------------------";

/// Function-name prefixes of frames that belong to the capture itself.
const MACHINERY: &[&str] = &[
    "std::backtrace",
    "std::panicking",
    "std::panic::",
    "std::sys",
    "core::panicking",
    "rust_begin_unwind",
    "__rustc::rust_begin_unwind",
    "<alloc::boxed::Box<",
    "dbshard_core::supervisor::install_hook",
];

/// Prefixes of frames on the raising side of a panic. The frame after the
/// last of these is the panic site.
const RAISE_PATH: &[&str] = &[
    "core::panicking::",
    "rust_begin_unwind",
    "__rustc::rust_begin_unwind",
    "std::panicking::begin_panic",
    "std::panicking::rust_panic_with_hook",
    "std::panicking::panic_with_hook",
    "std::panic::panic_any",
];

static HOOK: Once = Once::new();

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_TRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

/// One rendered stack frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// A caught panic: its payload plus the frames leading to it.
pub struct PanicReport {
    message: String,
    frames: Vec<Frame>,
    payload: Box<dyn Any + Send>,
}

impl PanicReport {
    fn new(payload: Box<dyn Any + Send>) -> Self {
        let message = payload_message(payload.as_ref());
        let frames = LAST_TRACE
            .with(|slot| slot.borrow_mut().take())
            .map(|trace| parse_frames(&trace.to_string()))
            .unwrap_or_default();
        Self {
            message,
            frames,
            payload,
        }
    }

    /// The panic message, when the payload was a string.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The original panic payload, e.g. for `std::panic::resume_unwind`.
    pub fn into_payload(self) -> Box<dyn Any + Send> {
        self.payload
    }

    /// Multi-line report framed by [`SEPARATOR`].
    pub fn render(&self) -> String {
        let mut out = format!("\n{SEPARATOR}\nruntime error: {}\ntraceback:\n", self.message);
        if self.frames.is_empty() {
            out.push_str("    <unavailable>\n");
        }
        for (i, frame) in self.frames.iter().enumerate() {
            out.push_str(&format!(
                "    stack: {} [file: {}] [func: {}] [line: {}]\n",
                i + 1,
                frame.file.as_deref().unwrap_or("?"),
                frame.function,
                frame.line.map(|l| l.to_string()).unwrap_or_else(|| "?".into()),
            ));
        }
        out.push_str(SEPARATOR);
        out.push('\n');
        out
    }
}

impl fmt::Debug for PanicReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicReport")
            .field("message", &self.message)
            .field("frames", &self.frames.len())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for PanicReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

/// Run `task` on the current thread, catching any panic inside it.
pub fn run_supervised<F, R>(task: F) -> Result<R, PanicReport>
where
    F: FnOnce() -> R,
{
    install_hook();
    let result = {
        let _scope = Scope::enter();
        panic::catch_unwind(AssertUnwindSafe(task))
    };
    result.map_err(|payload| {
        let report = PanicReport::new(payload);
        debug!("{}", report.render());
        report
    })
}

/// Drive `future` to completion, catching a panic in any of its polls.
pub async fn catch_panics<F>(future: F) -> Result<F::Output, PanicReport>
where
    F: Future,
{
    install_hook();
    let mut future = pin!(future);
    let polled = std::future::poll_fn(|cx| {
        let _scope = Scope::enter();
        match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(cx))) {
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(payload)),
        }
    })
    .await;
    polled.map_err(PanicReport::new)
}

/// Spawn `future` as a fire-and-forget task whose panics are logged, never propagated.
///
/// The returned handle resolves once the task has finished, panicked or not.
pub fn spawn_supervised<F>(future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(report) = catch_panics(future).await {
            debug!("{}", report.render());
        }
    })
}

/// Marks the current thread as running supervised code.
struct Scope;

impl Scope {
    fn enter() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Scope
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if DEPTH.with(Cell::get) > 0 {
                let trace = Backtrace::force_capture();
                LAST_TRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            } else {
                previous(info);
            }
        }));
    });
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

/// Parse `std::backtrace::Backtrace`'s display output into frames, dropping
/// the capture machinery and keeping at most [`MAX_STACK`].
fn parse_frames(rendered: &str) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();

    for line in rendered.lines() {
        let trimmed = line.trim_start();
        if let Some(location) = trimmed.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                if frame.file.is_none() {
                    let (file, line) = split_location(location);
                    frame.file = Some(file);
                    frame.line = line;
                }
            }
            continue;
        }
        let Some((index, function)) = trimmed.split_once(": ") else {
            continue;
        };
        if index.chars().all(|c| c.is_ascii_digit()) && !index.is_empty() {
            frames.push(Frame {
                function: function.to_string(),
                file: None,
                line: None,
            });
        }
    }

    // catch_unwind frames below the panic site also live in std, so the cut
    // is made after the raising side, not after every std frame
    let last_raise = frames
        .iter()
        .rposition(|frame| starts_with_any(&frame.function, RAISE_PATH));
    let start = match last_raise {
        Some(last) => last + 1,
        None => frames
            .iter()
            .position(|frame| !starts_with_any(&frame.function, MACHINERY))
            .unwrap_or(frames.len()),
    };

    frames.into_iter().skip(start).take(MAX_STACK).collect()
}

fn starts_with_any(function: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| function.starts_with(prefix))
}

/// `path/to/file.rs:12:5` -> (`path/to/file.rs`, Some(12))
fn split_location(location: &str) -> (String, Option<u32>) {
    let mut parts = location.rsplitn(3, ':');
    let col = parts.next();
    let line = parts.next();
    let file = parts.next();
    match (file, line, col) {
        (Some(file), Some(line), Some(_)) => (file.to_string(), line.parse().ok()),
        _ => (location.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::LogCapture;

    #[test]
    fn test_run_supervised_passes_through_value() {
        let value = run_supervised(|| 40 + 2).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_run_supervised_catches_panic() {
        let report = run_supervised(|| -> u32 { panic!("boom") }).unwrap_err();
        assert_eq!(report.message(), "boom");
        assert!(report.frames().len() <= MAX_STACK);

        let rendered = report.render();
        assert!(rendered.contains(SEPARATOR));
        assert!(rendered.contains("runtime error: boom"));
        assert!(rendered.contains("traceback:"));
    }

    #[test]
    fn test_payload_is_returned() {
        let report = run_supervised(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(report.message(), "Box<dyn Any>");
        assert_eq!(*report.into_payload().downcast::<u8>().unwrap(), 7);
    }

    #[test]
    fn test_formatted_panic_message() {
        let shard = "orders-a";
        let report = run_supervised(|| panic!("probe failed for {shard}")).unwrap_err();
        assert_eq!(report.message(), "probe failed for orders-a");
    }

    #[tokio::test]
    async fn test_catch_panics_async() {
        assert_eq!(catch_panics(async { 5 }).await.unwrap(), 5);

        let report = catch_panics(async {
            tokio::task::yield_now().await;
            panic!("after yield");
        })
        .await
        .unwrap_err();
        assert_eq!(report.message(), "after yield");
    }

    #[tokio::test]
    async fn test_spawn_supervised_never_propagates() {
        let logs = LogCapture::default();
        let _guard = logs.install();

        let handle = spawn_supervised(async {
            panic!("probe exploded");
        });
        // the task finishes normally from tokio's point of view
        assert!(handle.await.is_ok());

        let out = logs.contents();
        assert!(out.contains("DEBUG"), "no debug record in {out}");
        assert!(out.contains(SEPARATOR));
        assert!(out.contains("runtime error: probe exploded"));
        assert!(out.contains("traceback:"));
        assert!(out.contains("stack: 1 "));

        // and the runtime keeps working afterwards
        let ok = spawn_supervised(async {});
        assert!(ok.await.is_ok());
    }

    #[test]
    fn test_parse_frames_skips_machinery() {
        let rendered = "\
   0: std::backtrace::Backtrace::force_capture
             at /rustc/abc/library/std/src/backtrace.rs:312:13
   1: dbshard_core::supervisor::install_hook::{{closure}}::{{closure}}
             at ./src/supervisor.rs:180:29
   2: <alloc::boxed::Box<dyn for<'a, 'b> core::ops::function::Fn<(&'a std::panic::PanicHookInfo<'b>,)>+Output = ()+core::marker::Send+core::marker::Sync> as core::ops::function::Fn<(&std::panic::PanicHookInfo,)>>::call
             at /rustc/abc/library/alloc/src/boxed.rs:1985:9
   3: std::panicking::rust_panic_with_hook
             at /rustc/abc/library/std/src/panicking.rs:809:13
   4: std::panicking::begin_panic_handler::{{closure}}
   5: std::sys::backtrace::__rust_end_short_backtrace
   6: rust_begin_unwind
   7: core::panicking::panic_fmt
             at /rustc/abc/library/core/src/panicking.rs:74:14
   8: app::probe::tick
             at ./src/probe.rs:42:9
   9: std::panicking::catch_unwind::do_call
  10: app::main
";
        let frames = parse_frames(rendered);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].function, "app::probe::tick");
        assert_eq!(frames[0].file.as_deref(), Some("./src/probe.rs"));
        assert_eq!(frames[0].line, Some(42));
        assert_eq!(frames[1].function, "std::panicking::catch_unwind::do_call");
        assert_eq!(frames[2].function, "app::main");
        assert_eq!(frames[2].file, None);
    }

    #[test]
    fn test_report_starts_at_panic_site() {
        let report = run_supervised(|| -> u32 { panic!("site") }).unwrap_err();
        let first = &report.frames()[0];
        assert!(
            first.function.contains("test_report_starts_at_panic_site"),
            "first frame was {first:?}"
        );
        assert!(first.file.as_deref().is_some_and(|f| f.ends_with("supervisor.rs")));

        let report = run_supervised(|| std::panic::panic_any(3u8)).unwrap_err();
        assert!(report.frames()[0]
            .function
            .contains("test_report_starts_at_panic_site"));
    }

    #[test]
    fn test_parse_frames_falls_back_to_leading_machinery() {
        let rendered = "\
   0: std::backtrace::Backtrace::force_capture
   1: app::worker::run
";
        let frames = parse_frames(rendered);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function, "app::worker::run");
    }

    #[test]
    fn test_parse_frames_caps_depth() {
        let rendered: String = (0..50)
            .map(|i| format!("  {i}: app::frame_{i}\n        at ./src/lib.rs:{i}:1\n"))
            .collect();
        let frames = parse_frames(&rendered);
        assert_eq!(frames.len(), MAX_STACK);
        assert_eq!(frames[0].function, "app::frame_0");
    }

    #[test]
    fn test_render_without_frames() {
        let report = PanicReport {
            message: "x".into(),
            frames: Vec::new(),
            payload: Box::new(()),
        };
        assert!(report.render().contains("<unavailable>"));
    }
}
