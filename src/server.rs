//! The server engine: a reactor thread owning every socket and the client
//! registry, and a processor thread interpreting commands. The two meet only
//! through the `in`/`out` notify queues and a published roster snapshot.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::client::{Client, Status};
use crate::error::{ChatError, Result};
use crate::message::Envelope;
use crate::queue::NotifyQueue;
use crate::reactor::{EventSet, Reactor, ReactorHandle, Scope};

pub const DEFAULT_MAX_CLIENTS: usize = 128;
pub const DEFAULT_LISTEN_BACKLOG: i32 = 64;

/// The one recognized control command; anything else is a broadcast.
const LIST_COMMAND: &str = "list";

/// Nick-to-status view of the registry, published by the reactor thread
/// after every mutation so the processor never reads the live registry.
type Roster = Arc<Mutex<HashMap<String, Status>>>;

struct ServerState {
    listener: TcpListener,
    clients: HashMap<String, Client>,
    in_queue: Arc<NotifyQueue<Envelope>>,
    out_queue: Arc<NotifyQueue<Envelope>>,
    roster: Roster,
}

impl ServerState {
    fn on_accept(&mut self, events: EventSet, scope: &mut Scope<ServerState>) -> Result<()> {
        if events.intersects(EventSet::ERROR | EventSet::HANGUP) {
            return Err(ChatError::Reactor(io::Error::other(
                "listen socket reported failure",
            )));
        }

        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(ChatError::Reactor(err)),
        };

        let mut client = Client::new(stream);
        let fd = client.as_raw_fd();
        match client.handshake() {
            Ok(nick) => {
                let nick = nick.to_string();
                // A reclaimed nickname evicts the previous owner instead of
                // leaving it orphaned.
                if let Some(mut old) = self.clients.remove(&nick) {
                    if old.status() == Status::Online {
                        warn!("nickname {} reclaimed, dropping previous connection", nick);
                        scope.del(old.as_raw_fd());
                        old.disconnect();
                    }
                }

                let handler_nick = nick.clone();
                scope.add(
                    fd,
                    EventSet::READABLE | EventSet::READ_CLOSED,
                    move |state: &mut ServerState, events, scope| {
                        state.on_client(&handler_nick, events, scope)
                    },
                );
                self.clients.insert(nick, client);
                self.publish_roster();
            }
            Err(err) => {
                warn!("handshake with {} failed: {}", peer, err);
                client.disconnect();
            }
        }
        Ok(())
    }

    fn on_client(
        &mut self,
        nick: &str,
        events: EventSet,
        scope: &mut Scope<ServerState>,
    ) -> Result<()> {
        let Some(client) = self.clients.get_mut(nick) else {
            return Ok(());
        };

        if events.intersects(EventSet::ERROR) {
            warn!("client socket for {} reported an error", nick);
        } else if events.intersects(EventSet::READ_CLOSED | EventSet::HANGUP) {
            debug!("peer {} closed the connection", nick);
        } else {
            match client.recv() {
                Ok(raw) => {
                    let body = String::from_utf8_lossy(&raw).into_owned();
                    self.in_queue.push(Envelope::new(body, nick));
                    return Ok(());
                }
                Err(err) => warn!("receive from {} failed: {}", nick, err),
            }
        }

        // The descriptor leaves the reactor before the client record is
        // touched; the offline entry stays in the registry until a new
        // connection claims the nickname.
        scope.del(client.as_raw_fd());
        client.disconnect();
        self.publish_roster();
        Ok(())
    }

    fn on_out_queue(&mut self, events: EventSet, scope: &mut Scope<ServerState>) -> Result<()> {
        if events.intersects(EventSet::ERROR | EventSet::HANGUP) {
            return Err(ChatError::Queue(io::Error::other(
                "out-queue notification descriptor failed",
            )));
        }

        let Some(envelope) = self.out_queue.try_pop() else {
            return Ok(());
        };

        for dst in envelope.destinations() {
            let Some(client) = self.clients.get_mut(dst) else {
                continue;
            };
            if client.status() != Status::Online {
                continue;
            }
            // One dead destination never costs the others their copy.
            if let Err(err) = client.send(envelope.body().as_bytes()) {
                warn!("send to {} failed: {}", dst, err);
                scope.del(client.as_raw_fd());
                client.disconnect();
                self.publish_roster();
            }
        }
        Ok(())
    }

    fn publish_roster(&self) {
        let mut roster = self
            .roster
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        roster.clear();
        roster.extend(
            self.clients
                .iter()
                .map(|(nick, client)| (nick.clone(), client.status())),
        );
    }
}

/// Stops a running [`ChatServer`] from another thread: the processor exits
/// at its next wake-up, the reactor after its current batch. Pending
/// envelopes are dropped.
#[derive(Clone)]
pub struct ServerHandle {
    reactor: ReactorHandle,
    in_queue: Arc<NotifyQueue<Envelope>>,
}

impl ServerHandle {
    pub fn stop(&self) {
        self.in_queue.close();
        self.reactor.stop();
    }
}

pub struct ChatServer {
    reactor: Reactor<ServerState>,
    state: ServerState,
    local_addr: SocketAddr,
}

impl ChatServer {
    /// Binds to `(iface, port)` with default limits.
    pub fn bind(iface: &str, port: u16) -> Result<Self> {
        Self::with_limits(iface, port, DEFAULT_MAX_CLIENTS, DEFAULT_LISTEN_BACKLOG)
    }

    pub fn with_limits(
        iface: &str,
        port: u16,
        max_clients: usize,
        listen_backlog: i32,
    ) -> Result<Self> {
        let listener = Self::listen(iface, port, listen_backlog)?;
        let local_addr = listener.local_addr().map_err(ChatError::Reactor)?;

        let in_queue = Arc::new(NotifyQueue::new()?);
        let out_queue = Arc::new(NotifyQueue::new()?);
        let roster: Roster = Arc::new(Mutex::new(HashMap::new()));

        let mut reactor = Reactor::new(max_clients)?;
        reactor.add(
            listener.as_raw_fd(),
            EventSet::READABLE,
            |state: &mut ServerState, events, scope| state.on_accept(events, scope),
        )?;
        reactor.add(
            out_queue.notify_fd(),
            EventSet::READABLE,
            |state: &mut ServerState, events, scope| state.on_out_queue(events, scope),
        )?;

        Ok(Self {
            reactor,
            state: ServerState {
                listener,
                clients: HashMap::new(),
                in_queue,
                out_queue,
                roster,
            },
            local_addr,
        })
    }

    fn listen(iface: &str, port: u16, backlog: i32) -> Result<TcpListener> {
        let ip: Ipv4Addr = iface.parse().map_err(|_| {
            ChatError::Reactor(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not an IPv4 interface address: {iface}"),
            ))
        })?;
        let addr = SocketAddrV4::new(ip, port);

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(ChatError::Reactor)?;
        socket.set_reuse_address(true).map_err(ChatError::Reactor)?;
        socket.bind(&addr.into()).map_err(ChatError::Reactor)?;
        socket.listen(backlog).map_err(ChatError::Reactor)?;
        // Accepted client sockets stay blocking; only accept itself must
        // never stall the reactor on a spurious wake-up.
        socket.set_nonblocking(true).map_err(ChatError::Reactor)?;

        Ok(socket.into())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            reactor: self.reactor.handle(),
            in_queue: Arc::clone(&self.state.in_queue),
        }
    }

    /// Runs the reactor on the calling thread and the command processor on
    /// a spawned one; returns when stopped or on a fatal reactor error.
    pub fn run(&mut self) -> Result<()> {
        let processor = {
            let in_queue = Arc::clone(&self.state.in_queue);
            let out_queue = Arc::clone(&self.state.out_queue);
            let roster = Arc::clone(&self.state.roster);
            thread::Builder::new()
                .name("processor".into())
                .spawn(move || processor_loop(&in_queue, &out_queue, &roster))
                .map_err(ChatError::Reactor)?
        };

        let result = self.reactor.run(&mut self.state);

        // Unblock the processor even when the reactor died on its own.
        self.state.in_queue.close();
        let _ = processor.join();
        result
    }
}

fn processor_loop(
    in_queue: &NotifyQueue<Envelope>,
    out_queue: &NotifyQueue<Envelope>,
    roster: &Mutex<HashMap<String, Status>>,
) {
    while let Some(envelope) = in_queue.wait_pop() {
        debug!("got message from user {}", envelope.source());

        let response = if envelope.body() == LIST_COMMAND {
            status_listing(roster, envelope.source())
        } else {
            broadcast(roster, &envelope)
        };
        out_queue.push(response);
    }
}

/// Response to `list`: one line per known nickname, padded to 10 columns,
/// sent back to the requester alone.
fn status_listing(roster: &Mutex<HashMap<String, Status>>, src: &str) -> Envelope {
    let mut listing = String::new();
    {
        let roster = roster.lock().unwrap_or_else(PoisonError::into_inner);
        for (nick, status) in roster.iter() {
            let _ = writeln!(listing, "{nick:<10}: {status}");
        }
    }

    let mut response = Envelope::new(listing, src);
    response.add_destination(src);
    response
}

/// Everything that is not a command goes to every online user but its
/// source, prefixed with the sender's nickname.
fn broadcast(roster: &Mutex<HashMap<String, Status>>, request: &Envelope) -> Envelope {
    let mut response = Envelope::new(
        format!("{}: {}", request.source(), request.body()),
        request.source(),
    );

    let roster = roster.lock().unwrap_or_else(PoisonError::into_inner);
    for (nick, status) in roster.iter() {
        if nick != request.source() && *status == Status::Online {
            response.add_destination(nick.clone());
        }
    }
    response
}
