//! Thread-local "prefix command" stack: arguments pushed onto this scope
//! are prepended to every command built while the scope is active.
//!
//! Replaces a context-manager idiom with a `Drop`-guarded push/pop pair,
//! matching the rest of the crate's preference for RAII guards over
//! explicit enter/exit calls.

use std::cell::RefCell;
use std::ffi::OsString;

thread_local! {
    static PREFIX_STACK: RefCell<Vec<Vec<OsString>>> = RefCell::new(Vec::new());
}

/// An active prefix-command scope. Popped from the thread-local stack when
/// dropped, regardless of how the scope's block exits.
pub struct PrefixScope {
    _private: (),
}

/// Push `prefix` (a program plus any leading arguments) onto the current
/// thread's prefix stack, returning a guard that pops it again on drop.
pub fn push(prefix: Vec<OsString>) -> PrefixScope {
    PREFIX_STACK.with(|stack| stack.borrow_mut().push(prefix));
    PrefixScope { _private: () }
}

/// The full prefix to prepend to a new command's argument vector, built by
/// concatenating every active scope from outermost to innermost.
pub fn current_prefix() -> Vec<OsString> {
    PREFIX_STACK.with(|stack| stack.borrow().iter().flatten().cloned().collect())
}

impl Drop for PrefixScope {
    fn drop(&mut self) {
        PREFIX_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stack_yields_empty_prefix() {
        assert!(current_prefix().is_empty());
    }

    #[test]
    fn pushed_scope_contributes_to_current_prefix() {
        let _guard = push(vec!["sudo".into()]);
        assert_eq!(current_prefix(), vec![OsString::from("sudo")]);
    }

    #[test]
    fn nested_scopes_concatenate_outermost_first() {
        let _outer = push(vec!["sudo".into()]);
        let _inner = push(vec!["-u".into(), "root".into()]);
        assert_eq!(
            current_prefix(),
            vec![
                OsString::from("sudo"),
                OsString::from("-u"),
                OsString::from("root"),
            ]
        );
    }

    #[test]
    fn dropping_a_scope_pops_it() {
        {
            let _guard = push(vec!["sudo".into()]);
            assert_eq!(current_prefix().len(), 1);
        }
        assert!(current_prefix().is_empty());
    }
}
