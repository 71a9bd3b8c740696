//! Event Hooks and Server Functions
//!
//! Hooks are registered per event name, either globally or scoped to a
//! channel. Triggering an event runs global hooks first, then the hooks of
//! every channel the triggering connection belongs to. A hook that fails or
//! panics is logged and the rest still run.
//!
//! Functions are named handlers clients invoke with a `call` envelope.

use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::channel::ChannelManager;
use super::error::CallError;
use super::registry::{ConnectionId, ConnectionRegistry};

pub const CONNECTION_OPEN: &str = "connection.open";
pub const CONNECTION_CLOSE: &str = "connection.close";
pub const CHANNEL_SUBSCRIBE: &str = "channel.subscribe";
pub const CHANNEL_UNSUBSCRIBE: &str = "channel.unsubscribe";
pub const MESSAGE_RECEIVED: &str = "message.received";
pub const MESSAGE_SENT: &str = "message.sent";
pub const ERROR: &str = "error";

/// Lifecycle events that exist whether or not anything listens
pub const DEFAULT_EVENTS: [&str; 7] = [
    CONNECTION_OPEN,
    CONNECTION_CLOSE,
    CHANNEL_SUBSCRIBE,
    CHANNEL_UNSUBSCRIBE,
    MESSAGE_RECEIVED,
    MESSAGE_SENT,
    ERROR,
];

/// What a hook is told about the event
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub event: &'a str,
    pub data: &'a Value,
    pub connection: Option<ConnectionId>,
    /// Set when the hook is scoped to a channel
    pub channel: Option<&'a str>,
}

/// An event listener
///
/// Implemented for any `Fn(&HookContext) -> anyhow::Result<()>`.
pub trait EventHook: Send + Sync {
    fn handle(&self, ctx: &HookContext<'_>) -> anyhow::Result<()>;
}

impl<F> EventHook for F
where
    F: Fn(&HookContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, ctx: &HookContext<'_>) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// A named RPC handler
///
/// Implemented for any `Fn(Value, ConnectionId) -> anyhow::Result<Value>`.
pub trait ServerFunction: Send + Sync {
    fn call(&self, params: Value, connection: ConnectionId) -> anyhow::Result<Value>;
}

impl<F> ServerFunction for F
where
    F: Fn(Value, ConnectionId) -> anyhow::Result<Value> + Send + Sync,
{
    fn call(&self, params: Value, connection: ConnectionId) -> anyhow::Result<Value> {
        self(params, connection)
    }
}

/// Identity of a registered hook, used to remove it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Ordered hooks per event name
#[derive(Default)]
pub struct HookTable {
    hooks: HashMap<String, Vec<(HookId, Box<dyn EventHook>)>>,
}

impl HookTable {
    fn add(&mut self, event: &str, id: HookId, hook: Box<dyn EventHook>) {
        self.hooks
            .entry(event.to_string())
            .or_default()
            .push((id, hook));
    }

    fn remove(&mut self, id: HookId) -> bool {
        let mut removed = false;
        self.hooks.retain(|_, hooks| {
            let before = hooks.len();
            hooks.retain(|(hook_id, _)| *hook_id != id);
            removed |= hooks.len() != before;
            !hooks.is_empty()
        });
        removed
    }

    fn for_event(&self, event: &str) -> &[(HookId, Box<dyn EventHook>)] {
        self.hooks.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    fn events(&self) -> impl Iterator<Item = &String> {
        self.hooks.keys()
    }
}

impl fmt::Debug for HookTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (event, hooks) in &self.hooks {
            map.entry(event, &hooks.len());
        }
        map.finish()
    }
}

/// Global hooks, hook bookkeeping and server functions
#[derive(Default)]
pub struct EventDispatcher {
    global: HookTable,
    /// Where each hook lives: `None` for global, channel name otherwise
    scopes: HashMap<HookId, Option<String>>,
    functions: HashMap<String, Box<dyn ServerFunction>>,
    next_hook_id: u64,
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("global", &self.global)
            .field("hooks", &self.scopes.len())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook, globally or on a channel (created if absent)
    pub fn on(
        &mut self,
        channels: &mut ChannelManager,
        event: &str,
        hook: Box<dyn EventHook>,
        channel: Option<&str>,
    ) -> HookId {
        self.next_hook_id += 1;
        let id = HookId(self.next_hook_id);

        match channel {
            Some(name) => channels.get_or_create(name).hooks.add(event, id, hook),
            None => self.global.add(event, id, hook),
        }
        self.scopes.insert(id, channel.map(str::to_string));

        tracing::debug!(event, channel, "Hook registered");
        id
    }

    /// Remove a hook by identity; false if it was not registered
    pub fn off(&mut self, channels: &mut ChannelManager, id: HookId) -> bool {
        let Some(scope) = self.scopes.remove(&id) else {
            return false;
        };

        match scope {
            Some(name) => {
                let removed = channels
                    .get_mut(&name)
                    .map_or(false, |channel| channel.hooks.remove(id));
                channels.collect(&name);
                removed
            }
            None => self.global.remove(id),
        }
    }

    /// Run hooks for `event`, returning how many completed successfully
    ///
    /// With a connection, hooks scoped to each of its channels run after the
    /// global ones, in channel-name order.
    pub fn trigger(
        &self,
        registry: &ConnectionRegistry,
        channels: &ChannelManager,
        event: &str,
        data: &Value,
        connection: Option<ConnectionId>,
    ) -> usize {
        let mut succeeded = 0;
        let global = HookContext {
            event,
            data,
            connection,
            channel: None,
        };
        for (_, hook) in self.global.for_event(event) {
            succeeded += usize::from(run_hook(hook.as_ref(), &global));
        }

        let Some(subscribed) = connection
            .and_then(|id| registry.get(id))
            .map(|c| &c.subscribed_channels)
        else {
            return succeeded;
        };

        let mut names: Vec<&String> = subscribed.iter().collect();
        names.sort();
        for name in names {
            let Some(channel) = channels.get(name) else {
                continue;
            };
            let scoped = HookContext {
                channel: Some(name.as_str()),
                ..global
            };
            for (_, hook) in channel.hooks.for_event(event) {
                succeeded += usize::from(run_hook(hook.as_ref(), &scoped));
            }
        }
        succeeded
    }

    /// Register a function, replacing any with the same name
    pub fn define_function(&mut self, name: &str, function: Box<dyn ServerFunction>) {
        if self.functions.insert(name.to_string(), function).is_some() {
            tracing::warn!(function = %name, "Function redefined");
        } else {
            tracing::debug!(function = %name, "Function defined");
        }
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Invoke a function; failures and panics become `CallError::Failed`
    pub fn call_function(
        &self,
        name: &str,
        params: Value,
        connection: ConnectionId,
    ) -> Result<Value, CallError> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| CallError::NotFound(name.to_string()))?;

        match catch_unwind(AssertUnwindSafe(|| function.call(params, connection))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!(function = %name, connection_id = %connection, error = %e, "Function failed");
                Err(CallError::Failed(e.to_string()))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(function = %name, connection_id = %connection, panic = %message, "Function panicked");
                Err(CallError::Failed(message))
            }
        }
    }

    /// Default events plus every event with a global hook, sorted
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = DEFAULT_EVENTS.iter().map(|e| e.to_string()).collect();
        for event in self.global.events() {
            if !events.contains(event) {
                events.push(event.clone());
            }
        }
        events.sort();
        events
    }
}

fn run_hook(hook: &dyn EventHook, ctx: &HookContext<'_>) -> bool {
    match catch_unwind(AssertUnwindSafe(|| hook.handle(ctx))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!(event = ctx.event, channel = ctx.channel, error = %e, "Event hook failed");
            false
        }
        Err(panic) => {
            tracing::error!(
                event = ctx.event,
                channel = ctx.channel,
                panic = %panic_message(panic.as_ref()),
                "Event hook panicked"
            );
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::registry::tests::connect;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, tag: &'static str) -> Box<dyn EventHook> {
        let log = log.clone();
        Box::new(move |ctx: &HookContext<'_>| -> anyhow::Result<()> {
            log.lock().unwrap().push(format!(
                "{}:{}:{}",
                tag,
                ctx.event,
                ctx.channel.unwrap_or("-")
            ));
            Ok(())
        })
    }

    #[test]
    fn test_default_events() {
        let mut dispatcher = EventDispatcher::new();
        let mut channels = ChannelManager::new();
        let events = dispatcher.events();
        for event in DEFAULT_EVENTS {
            assert!(events.contains(&event.to_string()));
        }

        let log = Log::default();
        dispatcher.on(&mut channels, "custom", recorder(&log, "g"), None);
        assert!(dispatcher.events().contains(&"custom".to_string()));
        assert_eq!(dispatcher.events().len(), DEFAULT_EVENTS.len() + 1);
    }

    #[test]
    fn test_trigger_order_global_then_channels() {
        let mut registry = ConnectionRegistry::new();
        let mut channels = ChannelManager::new();
        let mut dispatcher = EventDispatcher::new();
        let (id, _rx) = connect(&mut registry);
        channels.subscribe(&mut registry, id, "b", None).unwrap();
        channels.subscribe(&mut registry, id, "a", None).unwrap();

        let log = Log::default();
        dispatcher.on(&mut channels, "ping", recorder(&log, "1"), None);
        dispatcher.on(&mut channels, "ping", recorder(&log, "2"), Some("b"));
        dispatcher.on(&mut channels, "ping", recorder(&log, "3"), Some("a"));
        dispatcher.on(&mut channels, "ping", recorder(&log, "4"), None);
        dispatcher.on(&mut channels, "other", recorder(&log, "x"), None);

        let ran = dispatcher.trigger(&registry, &channels, "ping", &json!({}), Some(id));
        assert_eq!(ran, 4);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["1:ping:-", "4:ping:-", "3:ping:a", "2:ping:b"]
        );
    }

    #[test]
    fn test_trigger_without_connection_skips_channel_hooks() {
        let registry = ConnectionRegistry::new();
        let mut channels = ChannelManager::new();
        let mut dispatcher = EventDispatcher::new();

        let log = Log::default();
        dispatcher.on(&mut channels, "tick", recorder(&log, "g"), None);
        dispatcher.on(&mut channels, "tick", recorder(&log, "c"), Some("room"));

        dispatcher.trigger(&registry, &channels, "tick", &Value::Null, None);
        assert_eq!(*log.lock().unwrap(), vec!["g:tick:-"]);
    }

    #[test]
    fn test_failing_hooks_are_isolated() {
        let registry = ConnectionRegistry::new();
        let mut channels = ChannelManager::new();
        let mut dispatcher = EventDispatcher::new();

        let log = Log::default();
        dispatcher.on(
            &mut channels,
            "e",
            Box::new(|_: &HookContext<'_>| -> anyhow::Result<()> {
                Err(anyhow::anyhow!("nope"))
            }),
            None,
        );
        dispatcher.on(
            &mut channels,
            "e",
            Box::new(|_: &HookContext<'_>| -> anyhow::Result<()> { panic!("hook exploded") }),
            None,
        );
        dispatcher.on(&mut channels, "e", recorder(&log, "after"), None);

        let ran = dispatcher.trigger(&registry, &channels, "e", &Value::Null, None);
        assert_eq!(ran, 1);
        assert_eq!(*log.lock().unwrap(), vec!["after:e:-"]);
    }

    #[test]
    fn test_off_removes_by_identity() {
        let registry = ConnectionRegistry::new();
        let mut channels = ChannelManager::new();
        let mut dispatcher = EventDispatcher::new();

        let log = Log::default();
        let first = dispatcher.on(&mut channels, "e", recorder(&log, "1"), None);
        dispatcher.on(&mut channels, "e", recorder(&log, "2"), None);

        assert!(dispatcher.off(&mut channels, first));
        assert!(!dispatcher.off(&mut channels, first));

        dispatcher.trigger(&registry, &channels, "e", &Value::Null, None);
        assert_eq!(*log.lock().unwrap(), vec!["2:e:-"]);
    }

    #[test]
    fn test_scoped_hook_keeps_channel_until_removed() {
        let mut channels = ChannelManager::new();
        let mut dispatcher = EventDispatcher::new();

        let log = Log::default();
        let id = dispatcher.on(&mut channels, "e", recorder(&log, "c"), Some("watched"));
        assert!(channels.contains("watched"));

        assert!(dispatcher.off(&mut channels, id));
        assert!(!channels.contains("watched"));
    }

    #[test]
    fn test_call_function() {
        let mut registry = ConnectionRegistry::new();
        let mut dispatcher = EventDispatcher::new();
        let (id, _rx) = connect(&mut registry);

        dispatcher.define_function(
            "sum",
            Box::new(|params: Value, _: ConnectionId| -> anyhow::Result<Value> {
                let total: i64 = params
                    .as_array()
                    .map(|items| items.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or(0);
                Ok(json!(total))
            }),
        );
        dispatcher.define_function(
            "fail",
            Box::new(|_: Value, _: ConnectionId| -> anyhow::Result<Value> {
                Err(anyhow::anyhow!("bad input"))
            }),
        );
        dispatcher.define_function(
            "crash",
            Box::new(|_: Value, _: ConnectionId| -> anyhow::Result<Value> { panic!("kaboom") }),
        );

        assert_eq!(
            dispatcher.call_function("sum", json!([1, 2, 3]), id),
            Ok(json!(6))
        );
        assert_eq!(
            dispatcher.call_function("missing", Value::Null, id),
            Err(CallError::NotFound("missing".to_string()))
        );
        assert_eq!(
            dispatcher.call_function("fail", Value::Null, id),
            Err(CallError::Failed("bad input".to_string()))
        );
        assert_eq!(
            dispatcher.call_function("crash", Value::Null, id),
            Err(CallError::Failed("kaboom".to_string()))
        );
    }
}
