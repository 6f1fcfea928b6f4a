//! Server session: socket ownership, login and the command round trip.
//!
//! A [`MapiServer`] owns the TCP socket exclusively. All traffic goes through
//! its [`BlockStream`]; nothing else reads or writes the socket.
//!
//! Only the dial honours a timeout. Once a session is ready, reads and
//! writes block without a deadline and there is no way to cancel a
//! command in flight.

use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use tracing::{debug, warn};

use super::auth::challenge_response;
use super::connection::MapiConfig;
use super::error::{MapiError, MapiResult};
use super::protocol::{control, marker, BlockStream};
use super::rows::parse_response;

/// Redirects followed during one login before giving up.
pub const MAX_REDIRECTS: usize = 10;

/// A session that can run commands.
///
/// [`MapiServer`] is the network implementation; [`super::Connection`] only
/// talks to this trait.
pub trait Server: Send {
    /// Send one framed command and return the raw response text.
    fn cmd(&mut self, operation: &str) -> MapiResult<String>;

    /// Close the session. Calling it again is a no-op.
    fn disconnect(&mut self) -> MapiResult<()>;
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Ready,
}

/// A MAPI session over TCP.
#[derive(Debug)]
pub struct MapiServer {
    config: MapiConfig,
    stream: Option<BlockStream<TcpStream>>,
    state: SessionState,
}

/// What the server answered to a login line.
enum LoginReply {
    Ready,
    Redirect(String),
}

impl MapiServer {
    /// Dial the server and log in.
    pub fn connect(config: &MapiConfig) -> MapiResult<Self> {
        let mut server = Self {
            config: config.clone(),
            stream: None,
            state: SessionState::Init,
        };
        server.dial()?;
        server.login()?;
        Ok(server)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &MapiConfig {
        &self.config
    }

    fn dial(&mut self) -> MapiResult<()> {
        let addrs = (self.config.hostname.as_str(), self.config.port).to_socket_addrs()?;
        let timeout = self.config.connect_timeout();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(%addr, "connected");
                    self.stream = Some(BlockStream::new(stream));
                    return Ok(());
                }
                Err(e) => {
                    debug!(%addr, error = %e, "dial failed");
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) => MapiError::Io(e),
            None => MapiError::Protocol(format!(
                "{}:{} did not resolve to any address",
                self.config.hostname, self.config.port
            )),
        })
    }

    /// Run the challenge-response exchange, following redirects.
    fn login(&mut self) -> MapiResult<()> {
        for hop in 0..=MAX_REDIRECTS {
            let stream = self.stream.as_mut().ok_or(MapiError::ConnectionClosed)?;

            let challenge = stream.read_message()?;
            let response = challenge_response(
                &challenge,
                &self.config.username,
                &self.config.password,
                &self.config.language,
                &self.config.database,
            )?;
            stream.write_message(&response)?;

            let reply = stream.read_message()?;
            match parse_login_reply(&reply)? {
                LoginReply::Ready => {
                    debug!(
                        user = %self.config.username,
                        database = %self.config.database,
                        "logged in"
                    );
                    self.state = SessionState::Ready;
                    return self.unlimit_reply_size();
                }
                LoginReply::Redirect(_) if hop == MAX_REDIRECTS => break,
                LoginReply::Redirect(target) => {
                    debug!(hop, %target, "login redirected");
                    self.follow_redirect(&target)?;
                }
            }
        }

        Err(MapiError::Login(format!(
            "gave up after {} redirects",
            MAX_REDIRECTS
        )))
    }

    /// Ask for every row of a result set in its first reply.
    fn unlimit_reply_size(&mut self) -> MapiResult<()> {
        let raw = self.cmd(&control("reply_size", -1))?;
        parse_response(&raw).map(|_| ())
    }

    fn follow_redirect(&mut self, target: &str) -> MapiResult<()> {
        let target = target.strip_prefix("mapi:").unwrap_or(target);

        if target.starts_with("merovingian://proxy") {
            // The proxy forwards this socket; log in again on it.
            return Ok(());
        }

        if target.starts_with("monetdb://") {
            let redirect = RedirectTarget::parse(target)?;
            self.close_stream()?;
            self.config.hostname = redirect.hostname;
            if let Some(port) = redirect.port {
                self.config.port = port;
            }
            if let Some(database) = redirect.database {
                self.config.database = database;
            }
            return self.dial();
        }

        Err(MapiError::Protocol(format!(
            "unsupported redirect target {}",
            target
        )))
    }

    fn close_stream(&mut self) -> MapiResult<()> {
        if let Some(stream) = self.stream.take() {
            self.state = SessionState::Init;
            stream.get_ref().shutdown(Shutdown::Both)?;
        }
        Ok(())
    }
}

impl Server for MapiServer {
    fn cmd(&mut self, operation: &str) -> MapiResult<String> {
        if self.state != SessionState::Ready {
            return Err(MapiError::ConnectionClosed);
        }
        let stream = self.stream.as_mut().ok_or(MapiError::ConnectionClosed)?;
        stream.write_message(operation)?;
        stream.read_message()
    }

    fn disconnect(&mut self) -> MapiResult<()> {
        if self.stream.is_none() {
            return Ok(());
        }
        debug!(host = %self.config.hostname, "disconnecting");
        self.close_stream().inspect_err(|e| warn!(error = %e, "socket shutdown failed"))
    }
}

/// A `monetdb://host[:port][/database]` redirect. Absent parts keep the
/// current session's values.
#[derive(Debug, PartialEq, Eq)]
struct RedirectTarget {
    hostname: String,
    port: Option<u16>,
    database: Option<String>,
}

impl RedirectTarget {
    fn parse(url: &str) -> MapiResult<Self> {
        let invalid = || MapiError::Protocol(format!("invalid redirect target {}", url));

        let rest = url.strip_prefix("monetdb://").ok_or_else(invalid)?;
        let rest = rest.split_once('?').map_or(rest, |(path, _)| path);

        let (host_port, database) = match rest.split_once('/') {
            Some((host_port, database)) => (host_port, Some(database)),
            None => (rest, None),
        };
        let (hostname, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (host, Some(port.parse::<u16>().map_err(|_| invalid())?)),
            None => (host_port, None),
        };
        if hostname.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            hostname: hostname.to_string(),
            port,
            database: database.filter(|db| !db.is_empty()).map(str::to_string),
        })
    }
}

fn parse_login_reply(reply: &str) -> MapiResult<LoginReply> {
    let lines: Vec<&str> = reply
        .lines()
        .filter(|line| !line.starts_with(marker::INFO) && !line.is_empty())
        .collect();

    let errors: Vec<&str> = lines
        .iter()
        .filter_map(|line| line.strip_prefix(marker::ERROR))
        .collect();
    if !errors.is_empty() {
        return Err(MapiError::Login(errors.join("\n")));
    }

    if let Some(target) = lines
        .iter()
        .find_map(|line| line.strip_prefix(marker::REDIRECT))
    {
        return Ok(LoginReply::Redirect(target.trim().to_string()));
    }

    match lines.first() {
        None => Ok(LoginReply::Ready),
        Some(line) => Err(MapiError::Protocol(format!(
            "unexpected login reply {:?}",
            line
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_means_ready() {
        assert!(matches!(parse_login_reply(""), Ok(LoginReply::Ready)));
        assert!(matches!(
            parse_login_reply("#welcome\n"),
            Ok(LoginReply::Ready)
        ));
    }

    #[test]
    fn test_error_reply_is_login_error() {
        match parse_login_reply("!InvalidCredentialsException:checkCredentials:invalid credentials for user 'x'\n") {
            Err(MapiError::Login(msg)) => assert!(msg.contains("invalid credentials")),
            other => panic!("expected login error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_redirect_reply() {
        match parse_login_reply("^mapi:merovingian://proxy?database=demo\n") {
            Ok(LoginReply::Redirect(target)) => {
                assert_eq!(target, "mapi:merovingian://proxy?database=demo")
            }
            _ => panic!("expected redirect"),
        }
    }

    #[test]
    fn test_redirect_target_keeps_absent_parts_unset() {
        assert_eq!(
            RedirectTarget::parse("monetdb://10.0.0.2:50001").unwrap(),
            RedirectTarget {
                hostname: "10.0.0.2".to_string(),
                port: Some(50001),
                database: None,
            }
        );
        assert_eq!(
            RedirectTarget::parse("monetdb://db.example.com/").unwrap(),
            RedirectTarget {
                hostname: "db.example.com".to_string(),
                port: None,
                database: None,
            }
        );
        assert_eq!(
            RedirectTarget::parse("monetdb://10.0.0.2:50001/archive?lang=sql")
                .unwrap()
                .database
                .as_deref(),
            Some("archive")
        );
    }

    #[test]
    fn test_malformed_redirect_target() {
        for url in ["monetdb://", "monetdb://host:port/db", "merovingian://proxy"] {
            assert!(matches!(
                RedirectTarget::parse(url),
                Err(MapiError::Protocol(_))
            ));
        }
    }

    #[test]
    fn test_unknown_reply_is_protocol_error() {
        assert!(matches!(
            parse_login_reply("&2 1 -1\n"),
            Err(MapiError::Protocol(_))
        ));
    }
}
