//! Observer and interceptor registry for lifecycle events.
//!
//! Two registration kinds share one event namespace:
//!
//! - **Observers** ([`HookRegistry::on`]) run for side effects. Each call is
//!   wrapped in an error boundary (errors and panics are logged), so one
//!   failing observer never stops the next one or the lifecycle step that
//!   fired the event.
//! - **Interceptors** ([`HookRegistry::intercept`]) run synchronously as a
//!   chain. Each receives the previous result and returns either a
//!   replacement (`Some`) or `None` to drop the operation. An interceptor
//!   that errors, or that takes longer than its budget, is treated as if it
//!   returned its input unchanged.
//!
//! Both kinds run in priority order (higher first); equal priorities run in
//! registration order. Registrations are keyed by `(event, name)`:
//! registering the same key again replaces the old entry.
//!
//! The registry is owned by the Hub control loop. Callbacks never get a
//! handle to it; modules register through [`crate::modules::ModuleContext`].
//!
//! # Events fired by the Hub
//!
//! | Event                   | Kind        | Payload                                  |
//! |-------------------------|-------------|------------------------------------------|
//! | `before_agent_create`   | interceptor | spawn request (`repo`, `branch`, ...)    |
//! | `filter_session_env`    | interceptor | `{agent_key, session, env}`              |
//! | `agent_status_changed`  | observer    | `{agent_key, status}`                    |
//! | `agent_created`         | observer    | agent record                             |
//! | `agent_deleted`         | observer    | `{agent_key}`                            |
//! | `agent_notification`    | observer    | `{agent_key, session, notification}`     |
//! | `shutdown`              | observer    | `null`                                   |

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::Value;

/// Observer callback.
pub type ObserverFn = Rc<dyn Fn(&Value) -> Result<()>>;

/// Interceptor callback. `Ok(None)` drops the operation.
pub type InterceptorFn = Rc<dyn Fn(Value) -> Result<Option<Value>>>;

/// Per-registration options.
#[derive(Debug, Clone, Default)]
pub struct HookOptions {
    /// Higher runs first.
    pub priority: i32,
    /// Starts disabled when true.
    pub disabled: bool,
    /// Interceptor budget; the registry default when `None`.
    pub timeout: Option<Duration>,
    /// Module that owns the registration.
    pub owner: Option<String>,
}

impl HookOptions {
    /// Options with the given priority.
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    /// Sets the interceptor budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the owning module.
    #[must_use]
    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

#[derive(Clone)]
enum Callback {
    Observer(ObserverFn),
    Interceptor { f: InterceptorFn, timeout: Duration },
}

/// One registration. Only obtainable through [`HookRegistry::take_owned`].
#[derive(Clone)]
pub struct Registration {
    event: String,
    name: String,
    priority: i32,
    enabled: bool,
    owner: Option<String>,
    seq: u64,
    callback: Callback,
}

impl Registration {
    /// Event name.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Registration name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("event", &self.event)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .field("owner", &self.owner)
            .field(
                "kind",
                &match self.callback {
                    Callback::Observer(_) => "observer",
                    Callback::Interceptor { .. } => "interceptor",
                },
            )
            .finish()
    }
}

/// Process-wide hook table.
pub struct HookRegistry {
    registrations: Vec<Registration>,
    next_seq: u64,
    default_timeout: Duration,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("registrations", &self.registrations.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new(Duration::from_millis(
            crate::constants::DEFAULT_INTERCEPTOR_TIMEOUT_MS,
        ))
    }
}

impl HookRegistry {
    /// Empty registry; interceptors without their own budget get `default_timeout`.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            registrations: Vec::new(),
            next_seq: 0,
            default_timeout,
        }
    }

    /// Registers an observer.
    pub fn on(&mut self, event: &str, name: &str, callback: ObserverFn, opts: HookOptions) {
        self.insert(event, name, Callback::Observer(callback), opts);
    }

    /// Registers an interceptor.
    pub fn intercept(&mut self, event: &str, name: &str, callback: InterceptorFn, opts: HookOptions) {
        let timeout = opts.timeout.unwrap_or(self.default_timeout);
        self.insert(event, name, Callback::Interceptor { f: callback, timeout }, opts);
    }

    fn insert(&mut self, event: &str, name: &str, callback: Callback, opts: HookOptions) {
        if self.remove(event, name).is_some() {
            log::debug!("[Hooks] Replacing {event}/{name}");
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.registrations.push(Registration {
            event: event.to_string(),
            name: name.to_string(),
            priority: opts.priority,
            enabled: !opts.disabled,
            owner: opts.owner,
            seq,
            callback,
        });
    }

    fn remove(&mut self, event: &str, name: &str) -> Option<Registration> {
        let idx = self
            .registrations
            .iter()
            .position(|r| r.event == event && r.name == name)?;
        Some(self.registrations.remove(idx))
    }

    /// Removes a registration. Returns whether it existed.
    pub fn off(&mut self, event: &str, name: &str) -> bool {
        self.remove(event, name).is_some()
    }

    /// Owner of a registration, if it exists and has one.
    pub fn owner_of(&self, event: &str, name: &str) -> Option<&str> {
        self.registrations
            .iter()
            .find(|r| r.event == event && r.name == name)
            .and_then(|r| r.owner.as_deref())
    }

    /// Enables or disables a registration. Returns whether it existed.
    pub fn set_enabled(&mut self, event: &str, name: &str, enabled: bool) -> bool {
        match self
            .registrations
            .iter_mut()
            .find(|r| r.event == event && r.name == name)
        {
            Some(r) => {
                r.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Drops every registration owned by `owner`; returns how many.
    pub fn clear_owner(&mut self, owner: &str) -> usize {
        self.take_owned(owner).len()
    }

    /// Removes and returns every registration owned by `owner`.
    pub fn take_owned(&mut self, owner: &str) -> Vec<Registration> {
        let (owned, kept) = std::mem::take(&mut self.registrations)
            .into_iter()
            .partition(|r| r.owner.as_deref() == Some(owner));
        self.registrations = kept;
        owned
    }

    /// Puts back registrations previously returned by [`take_owned`](Self::take_owned).
    ///
    /// Original registration order is kept; an entry whose key was
    /// registered again in the meantime is not restored.
    pub fn restore(&mut self, saved: Vec<Registration>) {
        for reg in saved {
            if self
                .registrations
                .iter()
                .any(|r| r.event == reg.event && r.name == reg.name)
            {
                continue;
            }
            self.registrations.push(reg);
        }
    }

    /// Whether an enabled observer exists for `event`.
    pub fn has_observers(&self, event: &str) -> bool {
        self.registrations
            .iter()
            .any(|r| r.enabled && r.event == event && matches!(r.callback, Callback::Observer(_)))
    }

    /// Whether an enabled interceptor exists for `event`.
    pub fn has_interceptors(&self, event: &str) -> bool {
        self.registrations.iter().any(|r| {
            r.enabled && r.event == event && matches!(r.callback, Callback::Interceptor { .. })
        })
    }

    /// Total registrations, enabled or not.
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// No registrations at all.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Enabled registrations for `event` in run order.
    fn ordered(&self, event: &str) -> Vec<Registration> {
        let mut regs: Vec<Registration> = self
            .registrations
            .iter()
            .filter(|r| r.enabled && r.event == event)
            .cloned()
            .collect();
        regs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        regs
    }

    /// Runs every observer of `event`. Returns how many completed without error.
    pub fn notify(&self, event: &str, payload: &Value) -> usize {
        let mut ok = 0;
        for reg in self.ordered(event) {
            let Callback::Observer(f) = &reg.callback else {
                continue;
            };
            match panic::catch_unwind(AssertUnwindSafe(|| f(payload))) {
                Ok(Ok(())) => ok += 1,
                Ok(Err(e)) => log::warn!("[Hooks] Observer {event}/{} failed: {e:#}", reg.name),
                Err(_) => log::error!("[Hooks] Observer {event}/{} panicked", reg.name),
            }
        }
        ok
    }

    /// Runs the interceptor chain of `event`.
    ///
    /// Returns the final value, or `None` if an interceptor dropped it.
    pub fn call(&self, event: &str, input: Value) -> Option<Value> {
        let mut value = input;
        for reg in self.ordered(event) {
            let Callback::Interceptor { f, timeout } = &reg.callback else {
                continue;
            };
            let started = Instant::now();
            let result = panic::catch_unwind(AssertUnwindSafe(|| f(value.clone())));
            let elapsed = started.elapsed();

            if elapsed > *timeout {
                log::warn!(
                    "[Hooks] Interceptor {event}/{} took {elapsed:?} (budget {timeout:?}), passing input through",
                    reg.name
                );
                continue;
            }
            match result {
                Ok(Ok(Some(next))) => value = next,
                Ok(Ok(None)) => {
                    log::info!("[Hooks] Interceptor {event}/{} dropped the operation", reg.name);
                    return None;
                }
                Ok(Err(e)) => {
                    log::warn!("[Hooks] Interceptor {event}/{} failed: {e:#}", reg.name);
                }
                Err(_) => log::error!("[Hooks] Interceptor {event}/{} panicked", reg.name),
            }
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> ObserverFn) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let make = move |label: &str| -> ObserverFn {
            let l = l.clone();
            let label = label.to_string();
            Rc::new(move |_| {
                l.borrow_mut().push(label.clone());
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_observers_run_by_priority_then_registration() {
        let mut hooks = HookRegistry::default();
        let (log, make) = recorder();
        hooks.on("e", "low", make("low"), HookOptions::priority(-1));
        hooks.on("e", "a", make("a"), HookOptions::default());
        hooks.on("e", "high", make("high"), HookOptions::priority(10));
        hooks.on("e", "b", make("b"), HookOptions::default());
        hooks.on("other", "x", make("x"), HookOptions::priority(100));

        assert_eq!(hooks.notify("e", &Value::Null), 4);
        assert_eq!(*log.borrow(), vec!["high", "a", "b", "low"]);
    }

    #[test]
    fn test_failing_observer_does_not_stop_lower_priority() {
        let mut hooks = HookRegistry::default();
        let (log, make) = recorder();
        hooks.on("e", "err", Rc::new(|_| anyhow::bail!("boom")), HookOptions::priority(5));
        hooks.on("e", "panics", Rc::new(|_| panic!("observer panic")), HookOptions::priority(3));
        hooks.on("e", "after", make("after"), HookOptions::priority(1));

        assert_eq!(hooks.notify("e", &json!({})), 1);
        assert_eq!(*log.borrow(), vec!["after"]);
    }

    #[test]
    fn test_interceptor_chain_transforms_in_order() {
        let mut hooks = HookRegistry::default();
        hooks.intercept(
            "e",
            "double",
            Rc::new(|v| Ok(Some(json!(v.as_i64().unwrap_or(0) * 2)))),
            HookOptions::priority(1),
        );
        hooks.intercept(
            "e",
            "inc",
            Rc::new(|v| Ok(Some(json!(v.as_i64().unwrap_or(0) + 1)))),
            HookOptions::priority(2),
        );
        assert_eq!(hooks.call("e", json!(3)), Some(json!(8)));
    }

    #[test]
    fn test_interceptor_drop_stops_chain() {
        let mut hooks = HookRegistry::default();
        let ran = Rc::new(RefCell::new(false));
        let r = ran.clone();
        hooks.intercept("e", "block", Rc::new(|_| Ok(None)), HookOptions::priority(2));
        hooks.intercept(
            "e",
            "later",
            Rc::new(move |v| {
                *r.borrow_mut() = true;
                Ok(Some(v))
            }),
            HookOptions::priority(1),
        );
        assert_eq!(hooks.call("e", json!("x")), None);
        assert!(!*ran.borrow());
    }

    #[test]
    fn test_interceptor_error_passes_through() {
        let mut hooks = HookRegistry::default();
        hooks.intercept("e", "bad", Rc::new(|_| anyhow::bail!("nope")), HookOptions::default());
        assert_eq!(hooks.call("e", json!({"a": 1})), Some(json!({"a": 1})));
    }

    #[test]
    fn test_slow_interceptor_is_pass_through() {
        let mut hooks = HookRegistry::new(Duration::from_millis(5));
        hooks.intercept(
            "e",
            "slow",
            Rc::new(|_| {
                std::thread::sleep(Duration::from_millis(30));
                Ok(Some(json!("replaced")))
            }),
            HookOptions::priority(2),
        );
        hooks.intercept(
            "e",
            "fast",
            Rc::new(|v| Ok(Some(json!(format!("{}!", v.as_str().unwrap_or_default()))))),
            HookOptions::priority(1).with_timeout(Duration::from_secs(5)),
        );
        assert_eq!(hooks.call("e", json!("orig")), Some(json!("orig!")));
    }

    #[test]
    fn test_no_interceptors_returns_input() {
        let hooks = HookRegistry::default();
        assert_eq!(hooks.call("e", json!(1)), Some(json!(1)));
    }

    #[test]
    fn test_same_key_replaces() {
        let mut hooks = HookRegistry::default();
        let (log, make) = recorder();
        hooks.on("e", "n", make("first"), HookOptions::default());
        hooks.on("e", "n", make("second"), HookOptions::default());
        assert_eq!(hooks.len(), 1);
        hooks.notify("e", &Value::Null);
        assert_eq!(*log.borrow(), vec!["second"]);
    }

    #[test]
    fn test_disable_and_off() {
        let mut hooks = HookRegistry::default();
        let (log, make) = recorder();
        hooks.on("e", "n", make("n"), HookOptions::default());
        assert!(hooks.set_enabled("e", "n", false));
        assert!(!hooks.has_observers("e"));
        hooks.notify("e", &Value::Null);
        assert!(log.borrow().is_empty());

        assert!(hooks.set_enabled("e", "n", true));
        assert!(hooks.off("e", "n"));
        assert!(!hooks.off("e", "n"));
        assert!(hooks.is_empty());
    }

    #[test]
    fn test_take_and_restore_owned() {
        let mut hooks = HookRegistry::default();
        let (log, make) = recorder();
        hooks.on("e", "mine", make("mine"), HookOptions::default().owned_by("mod"));
        hooks.on("e", "core", make("core"), HookOptions::default());

        let saved = hooks.take_owned("mod");
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].name(), "mine");
        hooks.notify("e", &Value::Null);
        assert_eq!(*log.borrow(), vec!["core"]);

        hooks.restore(saved);
        log.borrow_mut().clear();
        hooks.notify("e", &Value::Null);
        assert_eq!(*log.borrow(), vec!["mine", "core"]);

        assert_eq!(hooks.clear_owner("mod"), 1);
        assert_eq!(hooks.len(), 1);
    }
}
