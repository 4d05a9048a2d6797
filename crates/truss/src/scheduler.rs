use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use mio::Poll;
use tracing::{debug, error};

use crate::{
    Actor, ActorId, Directory, Event, PostError, SchedulerError,
    directory::Route,
    reactor::{Inbox, InboxMsg, Reactor, WAKE_TOKEN},
};

struct ReactorHandle {
    inbox: Arc<Inbox>,
    actor_count: Arc<AtomicUsize>,
    join: Option<thread::JoinHandle<()>>,
}

/// Owns N reactor threads and the actor directory. New actors land on the
/// reactor with the lowest actor count; once placed they stay there for
/// life (no work stealing).
pub struct Scheduler {
    directory: Arc<Directory>,
    reactors: Vec<ReactorHandle>,
}

impl Scheduler {
    /// Spawns `reactors` worker threads, each running one reactor loop.
    pub fn start(reactors: usize) -> Result<Self, SchedulerError> {
        if reactors == 0 {
            return Err(SchedulerError::NoReactors);
        }
        let directory = Arc::new(Directory::new());
        let mut handles = Vec::with_capacity(reactors);
        for index in 0..reactors {
            let poll = Poll::new()?;
            let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
            let inbox = Arc::new(Inbox::new(waker));
            let actor_count = Arc::new(AtomicUsize::new(0));
            let mut reactor =
                Reactor::new(index, poll, inbox.clone(), directory.clone(), actor_count.clone());
            let join = thread::Builder::new()
                .name(format!("truss-reactor-{index}"))
                .spawn(move || reactor.run())?;
            handles.push(ReactorHandle { inbox, actor_count, join: Some(join) });
        }
        debug!(reactors, "scheduler started");
        Ok(Self { directory, reactors: handles })
    }

    /// Places `actor` on the least-loaded reactor and returns its stable
    /// identity.
    pub fn schedule(&self, actor: Box<dyn Actor>) -> ActorId {
        let (index, handle) = self
            .reactors
            .iter()
            .enumerate()
            .min_by_key(|(_, h)| h.actor_count.load(Ordering::Relaxed))
            .expect("at least one reactor");
        handle.actor_count.fetch_add(1, Ordering::Relaxed);
        let id =
            self.directory.register(Route { reactor: index, inbox: handle.inbox.clone() });
        handle.inbox.send(InboxMsg::Register { actor, id });
        id
    }

    /// Posts an event to an actor from any thread; ordering per sender is
    /// preserved.
    pub fn post(&self, to: ActorId, event: Event) -> Result<(), PostError> {
        let route = self.directory.route(to).ok_or(PostError::StaleActor)?;
        route.inbox.send(InboxMsg::Post { id: to, event });
        Ok(())
    }

    /// Requests orderly teardown: the actor sees `KILL` on its next
    /// dispatch and is expected to close.
    pub fn post_kill(&self, to: ActorId) -> Result<(), PostError> {
        let route = self.directory.route(to).ok_or(PostError::StaleActor)?;
        route.inbox.send(InboxMsg::Kill { id: to });
        Ok(())
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Kills every hosted actor, waits for the reactors to drain and joins
    /// their threads.
    pub fn stop(mut self) {
        for handle in &self.reactors {
            handle.inbox.send(InboxMsg::Stop);
        }
        for handle in &mut self.reactors {
            if let Some(join) = handle.join.take()
                && join.join().is_err()
            {
                error!("reactor thread panicked");
            }
        }
    }
}
