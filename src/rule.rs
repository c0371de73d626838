//! Rule contexts and the compiled-ruleset call interface.
//!
//! The rules-file grammar and expression evaluator are external
//! collaborators; the core only consumes a compiled [`Ruleset`] through
//! this narrow interface.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use crate::device::{Device, SyncSelector};

/// Where an event originated, carried in the rule context for rules that
/// branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// Synthesized during a `boot`/`shutdown` sysfs walk replay.
    Sys,
    /// A forwarded event received over the framed protocol.
    Udev,
    /// A live event read directly off a kernel netlink socket.
    Kernel,
}

impl EventSource {
    pub fn as_str(self) -> &'static str {
        match self {
            EventSource::Sys => "sys",
            EventSource::Udev => "udev",
            EventSource::Kernel => "kernel",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Remove,
    Change,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Remove => "remove",
            Action::Change => "change",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Action::Add),
            "remove" => Some(Action::Remove),
            "change" => Some(Action::Change),
            _ => None,
        }
    }
}

/// Options attached to an `emit` directive: `"queue"` defers the
/// secondary event onto the client's outbound work queue, `"noenv"`
/// strips the environment before sending it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitOptions {
    pub queue: bool,
    pub noenv: bool,
}

/// A secondary synthetic event requested by a rule's `emit` call. `what`
/// is either empty/`"."` (clone the current device with a new action)
/// or a path relative to the current device's syspath to resolve
/// through the registry.
#[derive(Debug, Clone)]
pub struct EmitDirective {
    pub what: String,
    pub action: Action,
    pub options: EmitOptions,
}

/// Per-event mutable state threaded through rule evaluation.
pub struct RuleContext {
    pub device: Rc<Device>,
    pub action: Action,
    pub source: EventSource,
    /// Cleared by a rule to drop the event entirely.
    pub result: bool,
    /// Container-side device-node overrides.
    pub mode: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Host-side: which cgroup controllers to update for this event.
    pub cgroups: BTreeSet<String>,
    /// Host-side: which state components to ship alongside the event.
    pub forward: SyncSelector,
    pub emit: Option<EmitDirective>,
    /// Devices a rule touched and that must be flushed to persistence.
    pub modified_devices: Vec<Rc<Device>>,
    /// Mutable property overlay a rule may apply on top of `device`.
    pub properties: HashMap<String, String>,
    pub tags: BTreeSet<String>,
    pub devlinks: Vec<PathBuf>,
}

impl RuleContext {
    pub fn new(device: Rc<Device>, action: Action, source: EventSource) -> Self {
        let properties = device.properties.clone();
        let tags = device.tags.clone();
        let devlinks = device.devlinks.clone();
        Self {
            device,
            action,
            source,
            result: true,
            mode: None,
            owner: None,
            group: None,
            cgroups: BTreeSet::new(),
            forward: SyncSelector::empty(),
            emit: None,
            modified_devices: Vec::new(),
            properties,
            tags,
            devlinks,
        }
    }

    pub fn mark_modified(&mut self) {
        if !self
            .modified_devices
            .iter()
            .any(|d| d.syspath == self.device.syspath)
        {
            self.modified_devices.push(self.device.clone());
        }
    }
}

/// A compiled collection of rules ("preset") applied as one unit to a
/// [`RuleContext`]. The rules-file parser and expression evaluator that
/// produce a `Ruleset` are external to this crate; this trait is the
/// only interface the core calls through.
///
/// Evaluation is asynchronous so the router can bound it with
/// `tokio::time::timeout` and still observe whatever mutations happened
/// to `ctx` before the deadline.
///
/// `RuleContext` carries an `Rc<Device>`, so the returned future is
/// `!Send` like the rest of this crate's single-threaded, current-thread
/// runtime design (see the router's own `!Send` rationale).
pub trait Ruleset {
    fn evaluate<'a>(&'a self, ctx: &'a mut RuleContext) -> LocalBoxFuture<'a, ()>;
}

/// Compiles the contents of one rules file into a [`Ruleset`]. The
/// actual grammar and expression evaluator live outside this crate;
/// callers plug in whatever implementation understands the on-disk
/// rules format.
pub trait RulesetCompiler {
    fn compile(&self, path: &std::path::Path) -> anyhow::Result<Box<dyn Ruleset>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn device() -> Rc<Device> {
        Rc::new(Device {
            syspath: "/devices/virtual/sound/card0/pcmC0D0p".into(),
            subsystem: "sound".into(),
            sysname: "pcmC0D0p".into(),
            devpath: "/devices/virtual/sound/card0/pcmC0D0p".into(),
            devnode: Some("snd/pcmC0D0p".into()),
            devnum: (116, 24),
            properties: Map::new(),
            tags: BTreeSet::new(),
            devlinks: Vec::new(),
        })
    }

    struct DropEverything;
    impl Ruleset for DropEverything {
        fn evaluate<'a>(&'a self, ctx: &'a mut RuleContext) -> LocalBoxFuture<'a, ()> {
            Box::pin(async move {
                ctx.result = false;
            })
        }
    }

    #[tokio::test]
    async fn ruleset_can_drop_event() {
        let mut ctx = RuleContext::new(device(), Action::Add, EventSource::Kernel);
        DropEverything.evaluate(&mut ctx).await;
        assert!(!ctx.result);
    }

    #[tokio::test]
    async fn default_result_is_true() {
        let ctx = RuleContext::new(device(), Action::Add, EventSource::Kernel);
        assert!(ctx.result);
    }
}
