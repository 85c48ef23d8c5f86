use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{CastError, Result};
use crate::module::scope::TaskScope;
use crate::module::state::{ModuleState, SessionStateMachine, StartToken, StopAction};
use crate::module::{ModuleEvent, ServiceHost, Session, SessionFactory};
use crate::report::{Disposition, ErrorReporter};

const COMMAND_QUEUE_CAPACITY: usize = 32;

enum Command {
    Start(oneshot::Sender<Result<()>>),
    ServiceStarted(StartToken, oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<()>),
    Event(ModuleEvent, oneshot::Sender<Result<()>>),
    State(oneshot::Sender<ModuleState>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front end of a [`ModuleController`].
///
/// Every call waits for the controller's answer. Calls fail with
/// [`CastError::ChannelClosed`] once the controller has shut down.
#[derive(Debug, Clone)]
pub struct ModuleHandle {
    tx: mpsc::Sender<Command>,
}

impl ModuleHandle {
    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| CastError::ChannelClosed("module controller"))?;
        rx.await.map_err(|_| CastError::ChannelClosed("module controller"))
    }

    /// Ask the host to bring a session online. A no-op unless idle.
    pub async fn start_module(&self) -> Result<()> {
        self.call(Command::Start).await?
    }

    /// Host callback confirming a start request.
    pub async fn on_service_start(&self, token: StartToken) -> Result<()> {
        self.call(|reply| Command::ServiceStarted(token, reply)).await?
    }

    /// Tear the running session down and wait for it. The teardown
    /// completes even if this future is dropped.
    pub async fn stop_module(&self) -> Result<()> {
        self.call(Command::Stop).await
    }

    pub async fn send_event(&self, event: ModuleEvent) -> Result<()> {
        self.call(|reply| Command::Event(event, reply)).await?
    }

    pub async fn state(&self) -> Result<ModuleState> {
        self.call(Command::State).await
    }

    /// Stop any session and end the controller.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(Command::Shutdown).await
    }
}

struct RunningSession {
    session: Box<dyn Session>,
    scope: TaskScope,
    errors: mpsc::UnboundedReceiver<CastError>,
}

/// Single consumer of module commands; the only writer of the state
/// machine.
pub struct ModuleController {
    machine: SessionStateMachine<RunningSession>,
    host: Box<dyn ServiceHost>,
    factory: Box<dyn SessionFactory>,
    reporter: Arc<ErrorReporter>,
    commands: mpsc::Receiver<Command>,
    handle: mpsc::WeakSender<Command>,
}

enum Next {
    Command(Command),
    Error(CastError),
}

impl ModuleController {
    pub fn new(
        host: impl ServiceHost,
        factory: impl SessionFactory,
        reporter: Arc<ErrorReporter>,
    ) -> (Self, ModuleHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let controller = Self {
            machine: SessionStateMachine::new(),
            host: Box::new(host),
            factory: Box::new(factory),
            reporter,
            commands,
            handle: tx.downgrade(),
        };
        (controller, ModuleHandle { tx })
    }

    /// Create a controller and run it on the current runtime.
    pub fn spawn(
        host: impl ServiceHost,
        factory: impl SessionFactory,
        reporter: Arc<ErrorReporter>,
    ) -> (ModuleHandle, JoinHandle<()>) {
        let (controller, handle) = Self::new(host, factory, reporter);
        (handle, tokio::spawn(controller.run()))
    }

    /// Process commands until shut down or every handle is gone.
    pub async fn run(mut self) {
        loop {
            let next = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Next::Command(command),
                    None => break,
                },
                error = next_error(&mut self.machine) => Next::Error(error),
            };

            match next {
                Next::Command(Command::Shutdown(reply)) => {
                    self.stop_module().await;
                    let _ = reply.send(());
                    break;
                }
                Next::Command(command) => self.handle_command(command).await,
                Next::Error(error) => {
                    self.on_error(&error).await;
                }
            }
        }
        self.stop_module().await;
        tracing::debug!("module controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start_module());
            }
            Command::ServiceStarted(token, reply) => {
                let _ = reply.send(self.on_service_start(token).await);
            }
            Command::Stop(reply) => {
                self.stop_module().await;
                let _ = reply.send(());
            }
            Command::Event(event, reply) => {
                let _ = reply.send(self.send_event(event).await);
            }
            Command::State(reply) => {
                let _ = reply.send(self.machine.state());
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    fn start_module(&mut self) -> Result<()> {
        let Some(token) = self.machine.begin_start() else {
            return Ok(());
        };
        let Some(tx) = self.handle.upgrade() else {
            self.machine.abort_start(token);
            return Err(CastError::ChannelClosed("module controller"));
        };
        if let Err(e) = self.host.request_start(token, ModuleHandle { tx }) {
            tracing::warn!(%token, error = %e, "host refused to start the module");
            self.machine.abort_start(token);
            return Err(e);
        }
        tracing::info!(%token, "module start requested");
        Ok(())
    }

    /// Build and start a session for `token`. A start failure is reported,
    /// and may stop the module again, before it is returned.
    async fn on_service_start(&mut self, token: StartToken) -> Result<()> {
        if !self.machine.accept_start(token) {
            return Ok(());
        }

        self.reporter.clear();
        let mut session = self.factory.create();
        let (scope, errors) = TaskScope::new();
        let started = session.start(&scope).await;

        let running = RunningSession {
            session,
            scope,
            errors,
        };
        if let Err(mut running) = self.machine.set_running(token, running) {
            running.session.stop().await;
            running.scope.shutdown().await;
            return Ok(());
        }
        tracing::info!(%token, "module running");

        if let Err(e) = started {
            self.on_error(&e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn stop_module(&mut self) {
        match self.machine.begin_stop() {
            StopAction::Teardown(mut running) => {
                running.session.stop().await;
                running.scope.shutdown().await;
                self.machine.finish_stop();
                tracing::info!("module stopped");
            }
            StopAction::Discarded(token) => tracing::info!(%token, "pending start discarded"),
            StopAction::Ignored => {}
        }
    }

    async fn send_event(&mut self, event: ModuleEvent) -> Result<()> {
        let Some(running) = self.machine.running_mut() else {
            tracing::warn!(
                ?event,
                state = ?self.machine.state(),
                "event dropped, module not running"
            );
            return Ok(());
        };

        let recover = matches!(event, ModuleEvent::RecoverError);
        tracing::debug!(?event, "module event");
        match running.session.handle_event(event, &running.scope).await {
            Ok(()) => {
                if recover {
                    self.reporter.clear();
                }
                Ok(())
            }
            Err(e) => {
                self.on_error(&e).await;
                Err(e)
            }
        }
    }

    async fn on_error(&mut self, error: &CastError) {
        let streaming = self
            .machine
            .running_mut()
            .is_some_and(|running| running.session.is_streaming());
        if self.reporter.report(error, streaming) == Disposition::StopSession {
            tracing::info!(error = %error, "stopping module after error");
            self.stop_module().await;
        }
    }
}

async fn next_error(machine: &mut SessionStateMachine<RunningSession>) -> CastError {
    if let Some(running) = machine.running_mut() {
        if let Some(error) = running.errors.recv().await {
            return error;
        }
    }
    std::future::pending().await
}

/// Host that confirms every start request right away. Stands in for a
/// platform service when running as a plain process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackHost;

impl ServiceHost for LoopbackHost {
    fn request_start(&self, token: StartToken, module: ModuleHandle) -> Result<()> {
        tokio::spawn(async move {
            if let Err(e) = module.on_service_start(token).await {
                tracing::warn!(%token, error = %e, "service start failed");
            }
        });
        Ok(())
    }
}
