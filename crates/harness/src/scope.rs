//! Ordered acquisition with guaranteed reverse-order release
//!
//! A module run stands up its build, server and client pool through a list of
//! [`ScopeEntry`] values. [`Scopes::enter`] acquires them in order; when any
//! constructor or post-enter hook fails, everything acquired so far is released
//! in reverse order before the error is returned. Entries that were never
//! acquired are never released.
//!
//! ```text
//! enter:  build ──▶ server ──▶ pool
//! exit:   pool  ──▶ server ──▶ build
//! ```

use std::any::Any;
use std::marker::PhantomData;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::HarnessResult;

/// A resource that must be released when its scope ends.
#[async_trait]
pub trait Scoped: Any + Send + Sync {
    async fn release(&mut self) -> HarnessResult<()>;
}

/// Type-erased view of an acquired resource.
trait Slot: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn release_slot(&mut self) -> BoxFuture<'_, HarnessResult<()>>;
}

impl<T: Scoped> Slot for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn release_slot(&mut self) -> BoxFuture<'_, HarnessResult<()>> {
        Scoped::release(self)
    }
}

trait Acquire: Send {
    fn acquire<'s>(self: Box<Self>, scopes: &'s Scopes) -> BoxFuture<'s, HarnessResult<Box<dyn Slot>>>;
}

struct Constructor<F, R> {
    f: F,
    _resource: PhantomData<fn() -> R>,
}

impl<F, R> Acquire for Constructor<F, R>
where
    R: Scoped,
    F: for<'s> FnOnce(&'s Scopes) -> BoxFuture<'s, HarnessResult<R>> + Send,
{
    fn acquire<'s>(self: Box<Self>, scopes: &'s Scopes) -> BoxFuture<'s, HarnessResult<Box<dyn Slot>>> {
        let this = *self;
        let pending = (this.f)(scopes);
        Box::pin(async move {
            let resource = pending.await?;
            Ok(Box::new(resource) as Box<dyn Slot>)
        })
    }
}

type Hook = Box<dyn FnOnce(&Scopes) -> HarnessResult<()> + Send>;

enum EntryKind {
    Skip,
    Acquire {
        acquire: Box<dyn Acquire>,
        on_enter: Option<Hook>,
    },
}

/// One step of a scope list.
pub struct ScopeEntry {
    name: &'static str,
    kind: EntryKind,
}

impl ScopeEntry {
    /// An entry acquired by `constructor`.
    ///
    /// The constructor sees every resource acquired before it, so later
    /// stages can read what earlier ones produced.
    pub fn new<R, F>(name: &'static str, constructor: F) -> Self
    where
        R: Scoped,
        F: for<'s> FnOnce(&'s Scopes) -> BoxFuture<'s, HarnessResult<R>> + Send + 'static,
    {
        Self {
            name,
            kind: EntryKind::Acquire {
                acquire: Box::new(Constructor {
                    f: constructor,
                    _resource: PhantomData,
                }),
                on_enter: None,
            },
        }
    }

    /// An entry that contributes nothing and needs no cleanup.
    pub fn skip(name: &'static str) -> Self {
        Self {
            name,
            kind: EntryKind::Skip,
        }
    }

    /// Run `hook` right after this entry's resource is acquired.
    ///
    /// A failing hook aborts acquisition; this entry and the ones before it
    /// are still released. Has no effect on a skipped entry.
    pub fn on_enter<H>(mut self, hook: H) -> Self
    where
        H: FnOnce(&Scopes) -> HarnessResult<()> + Send + 'static,
    {
        if let EntryKind::Acquire { on_enter, .. } = &mut self.kind {
            *on_enter = Some(Box::new(hook));
        }
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_skip(&self) -> bool {
        matches!(self.kind, EntryKind::Skip)
    }
}

impl std::fmt::Debug for ScopeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeEntry")
            .field("name", &self.name)
            .field("skip", &self.is_skip())
            .finish()
    }
}

struct Entered {
    name: &'static str,
    resource: Box<dyn Slot>,
}

/// The resources acquired from a scope list, newest last.
#[derive(Default)]
pub struct Scopes {
    entered: Vec<Entered>,
    exited: bool,
}

impl Scopes {
    /// Acquire every non-skipped entry in order.
    pub async fn enter(entries: Vec<ScopeEntry>) -> HarnessResult<Self> {
        let mut scopes = Scopes::default();

        for entry in entries {
            let (acquire, on_enter) = match entry.kind {
                EntryKind::Skip => {
                    debug!(scope = entry.name, "skipped");
                    continue;
                }
                EntryKind::Acquire { acquire, on_enter } => (acquire, on_enter),
            };

            debug!(scope = entry.name, "entering");
            let resource = match acquire.acquire(&scopes).await {
                Ok(resource) => resource,
                Err(e) => {
                    warn!(scope = entry.name, error = %e, "acquisition failed, unwinding");
                    scopes.exit().await;
                    return Err(e);
                }
            };
            scopes.entered.push(Entered {
                name: entry.name,
                resource,
            });

            if let Some(hook) = on_enter {
                if let Err(e) = hook(&scopes) {
                    warn!(scope = entry.name, error = %e, "post-enter hook failed, unwinding");
                    scopes.exit().await;
                    return Err(e);
                }
            }
        }

        Ok(scopes)
    }

    /// The most recently acquired resource of type `T`.
    pub fn get<T: Scoped>(&self) -> Option<&T> {
        self.entered
            .iter()
            .rev()
            .find_map(|e| e.resource.as_any().downcast_ref::<T>())
    }

    pub fn get_mut<T: Scoped>(&mut self) -> Option<&mut T> {
        self.entered
            .iter_mut()
            .rev()
            .find_map(|e| e.resource.as_any_mut().downcast_mut::<T>())
    }

    /// Names of the acquired scopes in acquisition order.
    pub fn names(&self) -> Vec<&'static str> {
        self.entered.iter().map(|e| e.name).collect()
    }

    pub fn len(&self) -> usize {
        self.entered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entered.is_empty()
    }

    /// Release everything, newest first.
    ///
    /// A failed release is logged and does not stop the remaining ones.
    /// Calling this again is a no-op.
    pub async fn exit(&mut self) {
        while let Some(mut entered) = self.entered.pop() {
            debug!(scope = entered.name, "releasing");
            if let Err(e) = entered.resource.release_slot().await {
                warn!(scope = entered.name, error = %e, "release failed");
            }
        }
        self.exited = true;
    }
}

impl Drop for Scopes {
    fn drop(&mut self) {
        if !self.exited && !self.entered.is_empty() {
            warn!(
                scopes = ?self.names(),
                "scopes dropped without exit, dropping resources in reverse order"
            );
        }
        while let Some(entered) = self.entered.pop() {
            drop(entered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::sync::Arc;

    type Events = Arc<Mutex<Vec<String>>>;

    struct Probe {
        name: String,
        events: Events,
    }

    #[async_trait]
    impl Scoped for Probe {
        async fn release(&mut self) -> HarnessResult<()> {
            self.events.lock().push(format!("release {}", self.name));
            Ok(())
        }
    }

    struct Other;

    #[async_trait]
    impl Scoped for Other {
        async fn release(&mut self) -> HarnessResult<()> {
            Err(HarnessError::Build("release failure".into()))
        }
    }

    fn probe(name: &'static str, events: &Events) -> ScopeEntry {
        let events = Arc::clone(events);
        ScopeEntry::new(name, move |_: &Scopes| {
            async move {
                events.lock().push(format!("acquire {name}"));
                Ok(Probe {
                    name: name.to_string(),
                    events,
                })
            }
            .boxed()
        })
    }

    fn failing(name: &'static str, events: &Events) -> ScopeEntry {
        let events = Arc::clone(events);
        ScopeEntry::new(name, move |_: &Scopes| {
            async move {
                events.lock().push(format!("fail {name}"));
                Err::<Probe, _>(HarnessError::ClientSetup(name.to_string()))
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_releases_in_reverse_order() {
        let events = Events::default();
        let mut scopes = Scopes::enter(vec![
            probe("build", &events),
            probe("server", &events),
            probe("pool", &events),
        ])
        .await
        .unwrap();

        assert_eq!(scopes.names(), vec!["build", "server", "pool"]);
        scopes.exit().await;
        scopes.exit().await;

        assert_eq!(
            *events.lock(),
            vec![
                "acquire build",
                "acquire server",
                "acquire pool",
                "release pool",
                "release server",
                "release build",
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_releases_only_acquired_entries() {
        let events = Events::default();
        let err = Scopes::enter(vec![
            probe("build", &events),
            probe("server", &events),
            failing("pool", &events),
            probe("after", &events),
        ])
        .await
        .err()
        .unwrap();

        assert!(matches!(err, HarnessError::ClientSetup(_)));
        assert_eq!(
            *events.lock(),
            vec![
                "acquire build",
                "acquire server",
                "fail pool",
                "release server",
                "release build",
            ]
        );
    }

    #[tokio::test]
    async fn test_skipped_entries_contribute_nothing() {
        let events = Events::default();
        let mut scopes = Scopes::enter(vec![
            probe("build", &events),
            ScopeEntry::skip("server"),
            ScopeEntry::skip("pool"),
        ])
        .await
        .unwrap();

        assert_eq!(scopes.names(), vec!["build"]);
        scopes.exit().await;
        assert_eq!(*events.lock(), vec!["acquire build", "release build"]);
    }

    #[tokio::test]
    async fn test_hook_failure_releases_its_own_entry() {
        let events = Events::default();
        let hooked = probe("server", &events)
            .on_enter(|_| Err(HarnessError::ServerStart("hook".into())));

        let err = Scopes::enter(vec![probe("build", &events), hooked, probe("pool", &events)])
            .await
            .err()
            .unwrap();

        assert!(matches!(err, HarnessError::ServerStart(_)));
        assert_eq!(
            *events.lock(),
            vec![
                "acquire build",
                "acquire server",
                "release server",
                "release build",
            ]
        );
    }

    #[tokio::test]
    async fn test_hook_sees_acquired_resource() {
        let events = Events::default();
        let seen = Arc::new(Mutex::new(None));
        let seen_in_hook = Arc::clone(&seen);
        let entry = probe("build", &events).on_enter(move |scopes| {
            *seen_in_hook.lock() = scopes.get::<Probe>().map(|p| p.name.clone());
            Ok(())
        });

        let mut scopes = Scopes::enter(vec![entry]).await.unwrap();
        assert_eq!(seen.lock().as_deref(), Some("build"));
        scopes.exit().await;
    }

    #[tokio::test]
    async fn test_constructor_reads_earlier_scope() {
        let events = Events::default();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let observed_in_ctor = Arc::clone(&observed);
        let dependent = ScopeEntry::new("dependent", move |scopes: &Scopes| {
            async move {
                observed_in_ctor.lock().extend(scopes.names());
                Ok(Other)
            }
            .boxed()
        });

        let mut scopes = Scopes::enter(vec![probe("build", &events), dependent])
            .await
            .unwrap();
        assert_eq!(*observed.lock(), vec!["build"]);
        assert!(scopes.get::<Other>().is_some());
        assert!(scopes.get_mut::<Probe>().is_some());

        // The failing release of `Other` does not stop `build` from releasing.
        scopes.exit().await;
        assert_eq!(*events.lock(), vec!["acquire build", "release build"]);
    }

    #[tokio::test]
    async fn test_drop_without_exit_drops_everything() {
        struct Tracked(Arc<Mutex<Vec<&'static str>>>, &'static str);

        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.lock().push(self.1);
            }
        }

        #[async_trait]
        impl Scoped for Tracked {
            async fn release(&mut self) -> HarnessResult<()> {
                Ok(())
            }
        }

        let dropped = Arc::new(Mutex::new(Vec::new()));
        let entry = |name: &'static str| {
            let dropped = Arc::clone(&dropped);
            ScopeEntry::new(name, move |_: &Scopes| async move { Ok(Tracked(dropped, name)) }.boxed())
        };

        let scopes = Scopes::enter(vec![entry("first"), entry("second")]).await.unwrap();
        drop(scopes);
        assert_eq!(*dropped.lock(), vec!["second", "first"]);
    }
}
