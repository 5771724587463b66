//! Capture of failures into the `cause` record.

use std::env;
use std::error::Error;

use crate::id::random_hex64;
use crate::schema::{Cause, Exception, StackFrame};

/// Bound on `source()` hops so a cyclic chain cannot spin forever.
const MAX_CHAIN_DEPTH: usize = 32;

/// Frames kept per captured stack; anything deeper is dropped and counted.
const MAX_STACK_FRAMES: usize = 64;

/// Frames from these modules carry no signal for users and are elided.
const ELIDED_MODULES: [&str; 3] = ["xray::", "backtrace::", "std::backtrace"];

/// Builds a `cause` record from an error and its source chain. The stack is
/// captured once, for the outermost exception only.
pub(crate) fn capture<E>(err: &E, remote: bool) -> Cause
where
    E: Error + ?Sized,
{
    let type_name = short_type_name(std::any::type_name::<E>());
    capture_chain(err, Some(type_name), remote)
}

fn capture_chain<E>(err: &E, type_name: Option<String>, remote: bool) -> Cause
where
    E: Error + ?Sized,
{
    let mut exceptions = Vec::new();
    let mut skipped: u64 = 0;

    let mut push = |message: String, exception_type: Option<String>, exceptions: &mut Vec<Exception>| {
        if exceptions.len() == MAX_CHAIN_DEPTH {
            skipped += 1;
            return;
        }
        let id = random_hex64();
        if let Some(prev) = exceptions.last_mut() {
            prev.cause = Some(id.clone());
        }
        exceptions.push(Exception {
            id,
            message: Some(message),
            exception_type,
            remote,
            ..Exception::default()
        });
    };

    push(err.to_string(), type_name, &mut exceptions);
    let mut current = err.source();
    while let Some(cause) = current {
        push(cause.to_string(), None, &mut exceptions);
        current = cause.source();
    }

    if skipped > 0 {
        if let Some(last) = exceptions.last_mut() {
            last.skipped = skipped;
            last.cause = None;
        }
    }
    if let Some(first) = exceptions.first_mut() {
        let (stack, truncated) = capture_stack();
        first.stack = stack;
        first.truncated = truncated;
    }

    Cause {
        working_directory: env::current_dir()
            .ok()
            .map(|dir| dir.to_string_lossy().into_owned()),
        paths: Vec::new(),
        exceptions,
    }
}

/// Resolves the current backtrace into frames, skipping this SDK's own
/// internals and the backtrace machinery itself. The second value is the
/// number of frames dropped past the cap.
fn capture_stack() -> (Vec<StackFrame>, u64) {
    let trace = backtrace::Backtrace::new();
    let mut frames = Vec::new();
    for frame in trace.frames() {
        for symbol in frame.symbols() {
            let label = symbol.name().map(|name| name.to_string());
            if let Some(label) = &label {
                if ELIDED_MODULES.iter().any(|prefix| label.starts_with(prefix)) {
                    continue;
                }
            }
            frames.push(StackFrame {
                path: symbol
                    .filename()
                    .map(|path| path.to_string_lossy().into_owned()),
                line: symbol.lineno(),
                label,
            });
        }
    }
    bound_stack(frames)
}

/// Keeps the top of the stack and counts what was cut.
fn bound_stack(mut frames: Vec<StackFrame>) -> (Vec<StackFrame>, u64) {
    let truncated = frames.len().saturating_sub(MAX_STACK_FRAMES) as u64;
    frames.truncate(MAX_STACK_FRAMES);
    (frames, truncated)
}

/// `alloc::boxed::Box<dyn core::error::Error>` reads poorly in a trace; keep
/// the final path segment of the outer type.
fn short_type_name(full: &str) -> String {
    let head = full.split('<').next().unwrap_or(full);
    let tail = head.rsplit("::").next().unwrap_or(head);
    if tail.is_empty() {
        "unknown".to_string()
    } else {
        tail.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Layered {
        depth: usize,
        source: Option<Box<Layered>>,
    }

    impl Layered {
        fn chain(depth: usize) -> Layered {
            let mut err = Layered { depth: 0, source: None };
            for depth in 1..depth {
                err = Layered {
                    depth,
                    source: Some(Box::new(err)),
                };
            }
            err
        }
    }

    impl fmt::Display for Layered {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "layer {}", self.depth)
        }
    }

    impl Error for Layered {
        fn source(&self) -> Option<&(dyn Error + 'static)> {
            self.source.as_deref().map(|err| err as _)
        }
    }

    #[test]
    fn captures_full_chain() {
        let err = Layered::chain(3);
        let cause = capture(&err, false);
        assert_eq!(cause.exceptions.len(), 3);
        assert_eq!(cause.exceptions[0].message.as_deref(), Some("layer 2"));
        assert_eq!(cause.exceptions[2].message.as_deref(), Some("layer 0"));
        assert_eq!(cause.exceptions[0].exception_type.as_deref(), Some("Layered"));
        // each exception names its cause except the last
        assert_eq!(cause.exceptions[0].cause, Some(cause.exceptions[1].id.clone()));
        assert_eq!(cause.exceptions[2].cause, None);
        assert!(cause.working_directory.is_some());
    }

    #[test]
    fn long_chains_are_bounded() {
        let err = Layered::chain(40);
        let cause = capture(&err, false);
        assert_eq!(cause.exceptions.len(), 32);
        let last = cause.exceptions.last().unwrap();
        assert_eq!(last.skipped, 8);
        assert_eq!(last.cause, None);
    }

    #[test]
    fn short_stacks_are_kept_whole() {
        let frames: Vec<StackFrame> = (0..10)
            .map(|line| StackFrame {
                line: Some(line),
                ..StackFrame::default()
            })
            .collect();
        let (kept, truncated) = bound_stack(frames);
        assert_eq!(kept.len(), 10);
        assert_eq!(truncated, 0);
    }

    #[test]
    fn deep_stacks_are_bounded() {
        let frames: Vec<StackFrame> = (0..100)
            .map(|line| StackFrame {
                line: Some(line),
                ..StackFrame::default()
            })
            .collect();
        let (kept, truncated) = bound_stack(frames);
        assert_eq!(kept.len(), MAX_STACK_FRAMES);
        assert_eq!(truncated, 36);
        // the top of the stack survives
        assert_eq!(kept[0].line, Some(0));
        assert_eq!(kept.last().unwrap().line, Some(MAX_STACK_FRAMES as u32 - 1));
    }

    #[test]
    fn remote_flag_is_applied() {
        let err = Layered::chain(1);
        let cause = capture(&err, true);
        assert!(cause.exceptions.iter().all(|e| e.remote));
    }

    #[test]
    fn short_type_names() {
        assert_eq!(short_type_name("core::fmt::Error"), "Error");
        assert_eq!(short_type_name("Error"), "Error");
        assert_eq!(
            short_type_name("alloc::boxed::Box<dyn core::error::Error>"),
            "Box"
        );
    }
}
