use crate::scope::{Binding, Emit, Scope, ScopeHandle};
use crate::EngineConfig;
use anyhow::Context;
use budget::BudgetTable;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Engine runs a fixed number of scopes as tokio tasks, which share
/// a single BudgetTable.
pub struct Engine<X> {
    budgets: Arc<BudgetTable>,
    handles: Vec<ScopeHandle<X>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl<X: Send + 'static> Engine<X> {
    /// Start the engine's scopes, each emitting into the emitter built for
    /// its index. Must be called within a tokio runtime.
    #[tracing::instrument(level = "debug", skip_all, fields(scopes = config.scopes))]
    pub fn start(
        config: EngineConfig,
        mut emitter: impl FnMut(u8) -> Box<dyn Emit<X>>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            (1..=u8::MAX as usize).contains(&config.scopes),
            "scopes must be between 1 and {}, not {}",
            u8::MAX,
            config.scopes,
        );
        let budgets = Arc::new(BudgetTable::new(config.budget_slots));
        let shutdown = CancellationToken::new();

        let mut handles = Vec::with_capacity(config.scopes);
        let mut tasks = Vec::with_capacity(config.scopes);

        for index in 0..config.scopes as u8 {
            let scope = Scope::new(index, &config, budgets.clone(), emitter(index));
            handles.push(scope.handle());
            tasks.push(tokio::spawn(
                scope.run(config.idle.clone(), shutdown.child_token()),
            ));
        }
        tracing::info!(scopes = config.scopes, "started engine");

        Ok(Self {
            budgets,
            handles,
            tasks,
            shutdown,
        })
    }

    pub fn scopes(&self) -> usize {
        self.handles.len()
    }

    /// Handle of the scope at `index`.
    pub fn scope(&self, index: usize) -> Option<&ScopeHandle<X>> {
        self.handles.get(index)
    }

    pub fn budgets(&self) -> &Arc<BudgetTable> {
        &self.budgets
    }

    /// Attach a binding to every scope, using `factory` to build
    /// the instance of each scope index.
    pub fn attach(&self, mut factory: impl FnMut(u8) -> Box<dyn Binding<X>>) -> anyhow::Result<()> {
        for (index, handle) in self.handles.iter().enumerate() {
            handle
                .attach(factory(index as u8))
                .with_context(|| format!("attaching binding to scope {index}"))?;
        }
        Ok(())
    }

    /// Detach a binding from every scope.
    pub fn detach(&self, binding_id: u64) -> anyhow::Result<()> {
        for handle in &self.handles {
            handle.detach(binding_id)?;
        }
        Ok(())
    }

    /// Stop all scopes, detaching their bindings, and wait for them to exit.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.shutdown.cancel();

        for (index, task) in self.tasks.into_iter().enumerate() {
            task.await
                .with_context(|| format!("scope {index} failed"))?;
        }
        tracing::info!("stopped engine");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::Frame;
    use crate::proxy::{Forward, Translate};
    use crate::route::{Attributes, RouteTable};
    use crate::testing;
    use tokio::sync::mpsc;

    struct Passthrough;

    impl Translate<()> for Passthrough {
        fn attributes(&self, _begin: &crate::Begin<()>) -> Attributes {
            Attributes::new()
        }
    }

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let (tx, mut rx) = mpsc::unbounded_channel::<(u8, Frame<()>)>();

        struct Tagged(u8, mpsc::UnboundedSender<(u8, Frame<()>)>);
        impl Emit<()> for Tagged {
            fn emit(&mut self, frame: Frame<()>) {
                let _ = self.1.send((self.0, frame));
            }
        }

        let config = EngineConfig {
            scopes: 2,
            ..Default::default()
        };
        let engine = Engine::start(config, |index| Box::new(Tagged(index, tx.clone()))).unwrap();
        assert_eq!(engine.scopes(), 2);
        assert!(engine.scope(2).is_none());

        let routes: RouteTable = serde_json::from_str(r#"[{"id": 20}]"#).unwrap();
        let routes = Arc::new(routes);
        engine
            .attach(|_index| Box::new(Forward::new(10, routes.clone(), Passthrough)))
            .unwrap();

        engine
            .scope(1)
            .unwrap()
            .frame(testing::begin(10, 1, None))
            .unwrap();

        let (index, frame) = rx.recv().await.unwrap();
        assert_eq!((index, frame.kind()), (1, "begin"));
        assert_eq!(frame.header().routed_id, 20);
        // Delegate ids are namespaced by the scope which supplied them.
        assert_eq!(frame.stream_id() >> 56, 2);

        let scope = engine.scope(1).unwrap().clone();
        engine.shutdown().await.unwrap();

        // Detaching on shutdown cleans up the forwarded stream.
        let mut kinds = Vec::new();
        while let Ok((_, frame)) = rx.try_recv() {
            kinds.push(frame.kind());
        }
        assert_eq!(kinds, vec!["reset", "reset", "abort"]);
        assert!(scope.detach(10).is_err());
    }

    #[tokio::test]
    async fn test_invalid_scopes() {
        let config = EngineConfig {
            scopes: 0,
            ..Default::default()
        };
        let result = Engine::<()>::start(config, |_| Box::new(testing::Recorder::default()));
        assert!(result.is_err());
    }
}
