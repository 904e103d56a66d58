//! Human-readable stack traces.
//!
//! Output format, one block per frame:
//!
//! ```text
//! src/handlers.rs:27 (0x55d0c1a3f2b4)
//! 	Users.create: let id = ids[index];
//! ```
//!
//! Everything here is best-effort. A frame whose address cannot be resolved
//! renders as `???:0`, a source file that cannot be read renders its line as
//! `???`, and no failure aborts the capture.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use backtrace::{Backtrace, BacktraceFrame};

const DUNNO: &str = "???";

/// Frames of the capture itself, trimmed before `skip` is applied.
const CAPTURE_FRAMES: &[&str] = &[
    "strata::stack::stack",
    "strata::stack::Trace::capture",
];

/// Prefixes of frames that belong to the panic runtime rather than to the
/// code that panicked.
const PANIC_RUNTIME: &[&str] = &[
    "std::panicking::",
    "std::panic::",
    "core::panicking::",
    "core::panic::",
    "std::sys::backtrace::",
    "std::sys_common::backtrace::",
];

/// Formats the current call stack, skipping `skip` frames above the caller.
///
/// `stack(0)` starts at the function that called `stack`.
pub fn stack(skip: usize) -> String {
    guarded(|| {
        let mut trace = Backtrace::new_unresolved();
        trace.resolve();
        let frames = frames_of(trace.frames());
        let start = frames.iter().take_while(|f| is_capture_frame(f)).count();
        render(frames.into_iter().skip(start).skip(skip))
    })
}

/// Formats arbitrary code addresses with the same rules as [`stack`].
///
/// Addresses that do not map to any loaded symbol render as placeholders.
pub fn format_addresses(addresses: &[usize]) -> String {
    guarded(|| {
        let mut frames = Vec::new();
        for &ip in addresses {
            let before = frames.len();
            backtrace::resolve(ip as *mut c_void, |symbol| {
                frames.push(Frame {
                    ip,
                    file: symbol.filename().map(Path::to_path_buf),
                    line: symbol.lineno(),
                    function: symbol.name().map(|n| format!("{n:#}")),
                });
            });
            if frames.len() == before {
                frames.push(Frame::unresolved(ip));
            }
        }
        render(frames)
    })
}

/// An unresolved stack captured at one point and formatted later.
///
/// Capturing only records return addresses, which keeps it cheap enough to
/// run inside a panic hook. Symbol resolution and source reads happen in
/// [`render_from_panic_site`](Trace::render_from_panic_site).
pub struct Trace(Backtrace);

impl Trace {
    pub fn capture() -> Self {
        Self(Backtrace::new_unresolved())
    }

    /// Formats the trace starting at the frame that raised the panic, i.e.
    /// below the hook, the capture, and the panic runtime, then skips `skip`
    /// more frames.
    pub fn render_from_panic_site(mut self, skip: usize) -> String {
        guarded(move || {
            self.0.resolve();
            let frames = frames_of(self.0.frames());
            let start = panic_site(&frames);
            render(frames.into_iter().skip(start).skip(skip))
        })
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Trace").field(&self.0.frames().len()).finish()
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

struct Frame {
    ip: usize,
    file: Option<PathBuf>,
    line: Option<u32>,
    function: Option<String>,
}

impl Frame {
    fn unresolved(ip: usize) -> Self {
        Self { ip, file: None, line: None, function: None }
    }
}

/// One entry per symbol: an address that covers inlined calls expands into
/// several logical frames sharing that address.
fn frames_of(raw: &[BacktraceFrame]) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(raw.len());
    for frame in raw {
        let ip = frame.ip() as usize;
        let symbols = frame.symbols();
        if symbols.is_empty() {
            frames.push(Frame::unresolved(ip));
            continue;
        }
        for symbol in symbols {
            frames.push(Frame {
                ip,
                file: symbol.filename().map(Path::to_path_buf),
                line: symbol.lineno(),
                function: symbol.name().map(|n| format!("{n:#}")),
            });
        }
    }
    frames
}

fn is_capture_frame(frame: &Frame) -> bool {
    frame.function.as_deref().is_some_and(|name| {
        name.starts_with("backtrace::")
            || name.starts_with("<backtrace::")
            || CAPTURE_FRAMES.contains(&name)
    })
}

fn is_panic_runtime(frame: &Frame) -> bool {
    frame.function.as_deref().is_some_and(|name| {
        PANIC_RUNTIME.iter().any(|prefix| name.starts_with(prefix))
            || name.contains("rust_begin_unwind")
            || name.starts_with("__rust")
    })
}

/// Index of the first frame below the panic runtime. Falls back to the first
/// frame after the capture machinery when no runtime frame was resolved.
fn panic_site(frames: &[Frame]) -> usize {
    match frames.iter().position(is_panic_runtime) {
        Some(first) => first + frames[first..].iter().take_while(|f| is_panic_runtime(f)).count(),
        None => frames.iter().take_while(|f| is_capture_frame(f)).count(),
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

fn render(frames: impl IntoIterator<Item = Frame>) -> String {
    let mut out = String::new();
    let mut sources = SourceCache::default();

    for frame in frames {
        let line = frame.line.unwrap_or(0);
        let file = frame.file.as_deref().map_or_else(|| DUNNO.into(), Path::to_string_lossy);
        // write! into a String cannot fail
        let _ = writeln!(out, "{file}:{line} (0x{:x})", frame.ip);

        let function = frame.function.as_deref().map_or_else(|| DUNNO.to_owned(), short_name);
        let source = frame.file.as_deref()
            .and_then(|path| sources.line(path, line))
            .unwrap_or(DUNNO);
        let _ = writeln!(out, "\t{function}: {source}");
    }
    out
}

/// Source files read during one capture, keyed by path. A file that failed
/// to load is remembered as `None` so it is not retried for every frame.
#[derive(Default)]
struct SourceCache {
    files: HashMap<PathBuf, Option<Vec<String>>>,
}

impl SourceCache {
    /// The trimmed text of 1-indexed line `n`.
    fn line(&mut self, path: &Path, n: u32) -> Option<&str> {
        let lines = self.files
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                std::fs::read_to_string(path)
                    .ok()
                    .map(|text| text.lines().map(str::to_owned).collect())
            })
            .as_ref()?;
        let index = usize::try_from(n).ok()?.checked_sub(1)?;
        lines.get(index).map(|l| l.trim())
    }
}

/// Shortens a demangled symbol to `Type.method` form.
///
/// - `strata::middleware::recovery::Recovery::call` → `Recovery.call`
/// - `<app::Users as strata::Handler>::call::{{closure}}` → `Users.call.{{closure}}`
/// - `app::handlers::create` → `create`
pub fn short_name(full: &str) -> String {
    let segments = split_path(strip_hash(full));
    let Some(last_named) = segments.iter().rposition(|s| !s.starts_with("{{")) else {
        return segments.join(".");
    };
    let mut start = last_named;
    if start > 0 && is_type_segment(segments[start - 1]) {
        start -= 1;
    }
    segments[start..].iter().map(|s| unqualify(s)).collect::<Vec<_>>().join(".")
}

/// Drops a trailing `::h0123456789abcdef` disambiguator.
fn strip_hash(name: &str) -> &str {
    match name.rsplit_once("::h") {
        Some((head, hash)) if hash.len() == 16 && hash.bytes().all(|b| b.is_ascii_hexdigit()) => head,
        _ => name,
    }
}

/// Splits on `::` outside of `<…>`.
fn split_path(name: &str) -> Vec<&str> {
    let bytes = name.as_bytes();
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            // `->` inside `fn(..) -> T` is not a closing bracket
            b'>' if i == 0 || bytes[i - 1] != b'-' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                segments.push(&name[start..i]);
                i += 2;
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    segments.push(&name[start..]);
    segments.retain(|s| !s.is_empty());
    segments
}

fn is_type_segment(segment: &str) -> bool {
    segment.starts_with('<') || segment.starts_with(|c: char| c.is_ascii_uppercase())
}

/// `<a::Foo<T> as b::Trait>` → `Foo<T>`; anything else unchanged.
fn unqualify(segment: &str) -> &str {
    let Some(inner) = segment.strip_prefix('<').and_then(|s| s.strip_suffix('>')) else {
        return segment;
    };
    let self_ty = inner.split(" as ").next().unwrap_or(inner);
    split_path(self_ty).last().copied().unwrap_or(self_ty)
}

fn guarded(f: impl FnOnce() -> String) -> String {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| format!("{DUNNO}\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names() {
        assert_eq!(short_name("strata::middleware::recovery::Recovery::call"), "Recovery.call");
        assert_eq!(
            short_name("<strata::middleware::recovery::Recovery as strata::handler::Handler>::call::{{closure}}"),
            "Recovery.call.{{closure}}",
        );
        assert_eq!(short_name("app::handlers::create"), "create");
        assert_eq!(short_name("app::handlers::create::h0123456789abcdef"), "create");
        assert_eq!(short_name("main"), "main");
        assert_eq!(short_name("<alloc::boxed::Box<F,A> as core::ops::function::Fn<Args>>::call"), "Box<F,A>.call");
        assert_eq!(short_name("std::rt::lang_start::{{closure}}"), "lang_start.{{closure}}");
    }

    #[test]
    fn arrow_does_not_close_generics() {
        assert_eq!(split_path("<fn() -> u8 as a::B>::call"), vec!["<fn() -> u8 as a::B>", "call"]);
    }

    #[test]
    fn invalid_addresses_degrade_to_placeholders() {
        let out = format_addresses(&[0x0, 0x1, 0xdead]);
        assert_eq!(out.lines().count(), 6);
        assert!(out.starts_with("???:0 (0x0)\n\t???: ???\n"));
        assert!(out.contains("???:0 (0x1)\n"));
        assert!(out.contains("???:0 (0xdead)\n"));
    }

    #[test]
    fn unreadable_source_falls_back() {
        let mut cache = SourceCache::default();
        assert_eq!(cache.line(Path::new("/definitely/not/here.rs"), 3), None);
        assert_eq!(cache.files.len(), 1);
    }

    #[test]
    fn reads_and_trims_source_lines() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("src/stack.rs");
        let mut cache = SourceCache::default();
        assert_eq!(cache.line(&path, 1), Some("//! Human-readable stack traces."));
        assert_eq!(cache.line(&path, 0), None);
        assert_eq!(cache.line(&path, u32::MAX), None);
    }

    #[test]
    fn live_stack_never_fails() {
        let out = stack(0);
        for block in out.lines().collect::<Vec<_>>().chunks(2) {
            assert!(block[0].contains(" (0x"), "frame line: {}", block[0]);
            if let Some(detail) = block.get(1) {
                assert!(detail.starts_with('\t'));
            }
        }
    }

    #[test]
    fn panic_site_skips_runtime_frames() {
        let named = |name: &str| Frame { ip: 0, file: None, line: None, function: Some(name.into()) };
        let frames = vec![
            named("backtrace::backtrace::trace"),
            named("strata::middleware::recovery_pro::install_panic_hook::{{closure}}"),
            named("std::panicking::rust_panic_with_hook"),
            named("__rustc::rust_begin_unwind"),
            named("core::panicking::panic_fmt"),
            named("app::handlers::create"),
            named("std::panic::catch_unwind"),
        ];
        assert_eq!(panic_site(&frames), 5);
    }
}
