//! Plugins and their hooks
//!
//! A plugin is a named set of hooks plus optional `initialize`/`shutdown`.
//! The registry checks the shape once at registration, then subscribes each
//! hook on the event bus exactly once.

use std::any::Any;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, info};

use super::bus::{Event, EventBus, EventKind, Handler, SubscriptionId};

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Plugin already registered: {0}")]
    Duplicate(String),

    #[error("Malformed plugin {name}: {reason}")]
    Malformed { name: String, reason: String },

    #[error("Plugin {name} failed to initialize: {source}")]
    Initialize {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, PluginError>;

/// A handler attached to one event
pub struct Hook {
    pub event: EventKind,
    pub priority: i32,
    pub handler: Handler,
}

impl Hook {
    pub fn new<F>(event: EventKind, handler: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<()> + 'static,
    {
        Self {
            event,
            priority: 0,
            handler: Rc::new(handler),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("event", &self.event)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// A feature module reacting to session events
pub trait Plugin: Any {
    /// Hooks to subscribe. Called once, at registration.
    fn hooks(&self) -> Vec<Hook>;

    /// Runs before any hook is subscribed; an error aborts registration
    fn initialize(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) {}

    fn as_any(&self) -> &dyn Any;
}

struct Registered {
    plugin: Box<dyn Plugin>,
    subscriptions: Vec<(EventKind, SubscriptionId)>,
}

pub struct PluginRegistry {
    bus: Rc<EventBus>,
    plugins: BTreeMap<String, Registered>,
}

impl PluginRegistry {
    pub fn new(bus: Rc<EventBus>) -> Self {
        Self {
            bus,
            plugins: BTreeMap::new(),
        }
    }

    pub fn register<P: Plugin>(&mut self, name: &str, plugin: P) -> Result<()> {
        self.register_boxed(name, Box::new(plugin))
    }

    pub fn register_boxed(&mut self, name: &str, mut plugin: Box<dyn Plugin>) -> Result<()> {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(PluginError::Malformed {
                name: name.to_string(),
                reason: "name must be non-empty without whitespace".to_string(),
            });
        }
        if self.plugins.contains_key(name) {
            return Err(PluginError::Duplicate(name.to_string()));
        }

        let hooks = plugin.hooks();
        validate_hooks(name, &hooks)?;

        plugin
            .initialize()
            .map_err(|e| PluginError::Initialize {
                name: name.to_string(),
                source: e.into(),
            })?;

        let subscriptions = hooks
            .into_iter()
            .map(|hook| {
                let id = self
                    .bus
                    .subscribe_handler(hook.event, hook.priority, hook.handler);
                (hook.event, id)
            })
            .collect::<Vec<_>>();

        info!(plugin = name, hooks = subscriptions.len(), "plugin registered");
        self.plugins.insert(
            name.to_string(),
            Registered {
                plugin,
                subscriptions,
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Plugin> {
        self.plugins.get(name).map(|r| r.plugin.as_ref())
    }

    /// Typed access to a registered plugin
    pub fn get_as<T: Plugin>(&self, name: &str) -> Option<&T> {
        self.get(name)?.as_any().downcast_ref::<T>()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered plugin names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    /// Detach a plugin's hooks and shut it down
    pub fn unregister(&mut self, name: &str) -> bool {
        let Some(registered) = self.plugins.remove(name) else {
            return false;
        };
        self.retire(name, registered);
        true
    }

    pub fn shutdown_all(&mut self) {
        for (name, registered) in std::mem::take(&mut self.plugins) {
            self.retire(&name, registered);
        }
    }

    fn retire(&self, name: &str, mut registered: Registered) {
        for (kind, id) in registered.subscriptions.drain(..) {
            self.bus.unsubscribe(kind, id);
        }
        registered.plugin.shutdown();
        debug!(plugin = name, "plugin shut down");
    }
}

fn validate_hooks(name: &str, hooks: &[Hook]) -> Result<()> {
    let malformed = |reason: String| PluginError::Malformed {
        name: name.to_string(),
        reason,
    };

    if hooks.is_empty() {
        return Err(malformed("declares no hooks".to_string()));
    }
    let mut seen = HashSet::new();
    for hook in hooks {
        if !seen.insert(hook.event) {
            return Err(malformed(format!("hooks {} more than once", hook.event)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct Counter {
        commands: Rc<Cell<usize>>,
        lifecycle: Rc<RefCell<Vec<&'static str>>>,
        fail_init: bool,
    }

    impl Plugin for Counter {
        fn hooks(&self) -> Vec<Hook> {
            let commands = Rc::clone(&self.commands);
            vec![Hook::new(EventKind::CommandExecuted, move |_| {
                commands.set(commands.get() + 1);
                Ok(())
            })]
        }

        fn initialize(&mut self) -> anyhow::Result<()> {
            if self.fail_init {
                anyhow::bail!("no config");
            }
            self.lifecycle.borrow_mut().push("init");
            Ok(())
        }

        fn shutdown(&mut self) {
            self.lifecycle.borrow_mut().push("shutdown");
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct Shapeless(Vec<EventKind>);

    impl Plugin for Shapeless {
        fn hooks(&self) -> Vec<Hook> {
            self.0.iter().map(|k| Hook::new(*k, |_| Ok(()))).collect()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn command() -> Event {
        Event::CommandExecuted {
            session_id: 1,
            command: "ls".to_string(),
        }
    }

    #[test]
    fn test_register_subscribes_hooks_once() {
        let bus = Rc::new(EventBus::default());
        let mut registry = PluginRegistry::new(Rc::clone(&bus));
        let counter = Counter::default();
        let commands = Rc::clone(&counter.commands);

        registry.register("counter", counter).unwrap();
        assert_eq!(bus.subscriber_count(EventKind::CommandExecuted), 1);

        bus.emit(&command());
        bus.emit(&command());
        assert_eq!(commands.get(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let bus = Rc::new(EventBus::default());
        let mut registry = PluginRegistry::new(Rc::clone(&bus));
        registry.register("counter", Counter::default()).unwrap();

        let err = registry.register("counter", Counter::default()).unwrap_err();
        assert!(matches!(err, PluginError::Duplicate(ref n) if n == "counter"));
        assert_eq!(bus.subscriber_count(EventKind::CommandExecuted), 1);
    }

    #[test]
    fn test_malformed_plugins_rejected() {
        let bus = Rc::new(EventBus::default());
        let mut registry = PluginRegistry::new(Rc::clone(&bus));

        let empty = registry.register("empty", Shapeless(vec![]));
        assert!(matches!(empty, Err(PluginError::Malformed { .. })));

        let doubled = Shapeless(vec![EventKind::TerminalCreated, EventKind::TerminalCreated]);
        assert!(matches!(
            registry.register("doubled", doubled),
            Err(PluginError::Malformed { .. })
        ));

        let bad_name = registry.register("has space", Shapeless(vec![EventKind::TerminalClosed]));
        assert!(matches!(bad_name, Err(PluginError::Malformed { .. })));

        assert_eq!(bus.subscriber_count(EventKind::TerminalCreated), 0);
        assert_eq!(registry.names().count(), 0);
    }

    #[test]
    fn test_failed_initialize_leaves_nothing_behind() {
        let bus = Rc::new(EventBus::default());
        let mut registry = PluginRegistry::new(Rc::clone(&bus));
        let counter = Counter {
            fail_init: true,
            ..Counter::default()
        };

        let err = registry.register("counter", counter).unwrap_err();
        assert!(matches!(err, PluginError::Initialize { .. }));
        assert!(err.to_string().contains("no config"));
        assert!(!registry.contains("counter"));
        assert_eq!(bus.subscriber_count(EventKind::CommandExecuted), 0);
    }

    #[test]
    fn test_get_and_get_as() {
        let bus = Rc::new(EventBus::default());
        let mut registry = PluginRegistry::new(bus);
        registry.register("counter", Counter::default()).unwrap();

        assert!(registry.get("counter").is_some());
        assert!(registry.get("missing").is_none());
        assert!(registry.get_as::<Counter>("counter").is_some());
        assert!(registry.get_as::<Shapeless>("counter").is_none());
    }

    #[test]
    fn test_unregister_and_shutdown_all() {
        let bus = Rc::new(EventBus::default());
        let mut registry = PluginRegistry::new(Rc::clone(&bus));
        let first = Counter::default();
        let first_life = Rc::clone(&first.lifecycle);
        let second = Counter::default();
        let second_life = Rc::clone(&second.lifecycle);
        registry.register("first", first).unwrap();
        registry.register("second", second).unwrap();
        assert_eq!(bus.subscriber_count(EventKind::CommandExecuted), 2);

        assert!(registry.unregister("first"));
        assert!(!registry.unregister("first"));
        assert_eq!(*first_life.borrow(), ["init", "shutdown"]);
        assert_eq!(bus.subscriber_count(EventKind::CommandExecuted), 1);

        registry.shutdown_all();
        assert_eq!(*second_life.borrow(), ["init", "shutdown"]);
        assert_eq!(bus.subscriber_count(EventKind::CommandExecuted), 0);
        assert_eq!(registry.names().count(), 0);
    }
}
