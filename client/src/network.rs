//! Client driver: handshake, background printer and the input loop

use log::{debug, info, warn};
use shared::HandshakeReply;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

pub const CLOSING_MESSAGE: &str = "Closing connection.";
pub const SERVER_CLOSED_MESSAGE: &str = "Server closed the connection.";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("server closed the connection")]
    ConnectionClosed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub ip: String,
    pub port: u16,
    pub user: String,
}

impl ClientConfig {
    pub fn new(ip: &str, port: u16, user: &str) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            user: user.to_string(),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Result of the username exchange
pub enum Handshake {
    Accepted(Client),
    Rejected(HandshakeReply),
}

type ServerLines = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;
type ServerSink = Box<dyn AsyncWrite + Send + Unpin>;

/// A connection whose username has been accepted by the server
pub struct Client {
    username: String,
    welcome: String,
    lines: ServerLines,
    writer: ServerSink,
}

impl Client {
    /// Connects to the server and registers `config.user`
    pub async fn connect(config: &ClientConfig) -> Result<Handshake, ClientError> {
        let stream = TcpStream::connect((config.ip.as_str(), config.port))
            .await
            .map_err(|source| ClientError::Connect {
                addr: config.address(),
                source,
            })?;
        info!("Connected to {}", config.address());

        let (reader, writer) = stream.into_split();
        Self::handshake(reader, writer, &config.user).await
    }

    /// Sends the username line and reads exactly one reply line
    pub async fn handshake<R, W>(
        reader: R,
        writer: W,
        username: &str,
    ) -> Result<Handshake, ClientError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let mut lines = BufReader::new(reader).lines();
        let mut writer: ServerSink = Box::new(writer);

        write_line(&mut writer, username).await?;

        let reply = lines
            .next_line()
            .await?
            .ok_or(ClientError::ConnectionClosed)?;

        match HandshakeReply::parse(&reply) {
            HandshakeReply::Welcome(welcome) => {
                info!("Registered as {}", username);
                Ok(Handshake::Accepted(Client {
                    username: username.to_string(),
                    welcome,
                    lines,
                    writer,
                }))
            }
            rejection => {
                warn!("Server rejected username {}: {}", username, rejection.as_line());
                Ok(Handshake::Rejected(rejection))
            }
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn welcome(&self) -> &str {
        &self.welcome
    }

    /// Runs the chat until `quit` is sent, input ends or the server hangs up
    ///
    /// Incoming lines are printed to `output` by a background task, which is
    /// detached when the send loop stops.
    pub async fn run<I, O>(self, input: I, output: O) -> Result<(), ClientError>
    where
        I: AsyncBufRead + Unpin,
        O: AsyncWrite + Send + Unpin + 'static,
    {
        let Client {
            username,
            welcome,
            mut lines,
            mut writer,
        } = self;

        let output = Arc::new(Mutex::new(output));
        print_line(&output, &welcome).await?;

        let printer_output = Arc::clone(&output);
        let mut printer = tokio::spawn(async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if print_line(&printer_output, &line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = print_line(&printer_output, SERVER_CLOSED_MESSAGE).await;
                        break;
                    }
                    Err(e) => {
                        warn!("Error reading from server: {}", e);
                        let _ = print_line(&printer_output, SERVER_CLOSED_MESSAGE).await;
                        break;
                    }
                }
            }
        });

        let mut input = input.lines();
        loop {
            tokio::select! {
                line = input.next_line() => match line? {
                    Some(line) => {
                        write_line(&mut writer, &line).await?;
                        if shared::is_quit(&line) {
                            info!("{} left the chat", username);
                            print_line(&output, CLOSING_MESSAGE).await?;
                            break;
                        }
                    }
                    None => {
                        debug!("End of input");
                        break;
                    }
                },
                _ = &mut printer => {
                    info!("Server closed the connection");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// User-facing text for a rejected username
pub fn rejection_message(reply: &HandshakeReply) -> &'static str {
    match reply {
        HandshakeReply::UsernameInvalid => "Username is invalid.",
        HandshakeReply::UserAlreadyExists => "Username already in use.",
        HandshakeReply::Welcome(_) => "Username accepted.",
    }
}

/// Connects and chats over the process's stdin and stdout
pub async fn run_interactive(config: ClientConfig) -> Result<(), ClientError> {
    match Client::connect(&config).await? {
        Handshake::Rejected(reply) => {
            println!("{}", rejection_message(&reply));
            Ok(())
        }
        Handshake::Accepted(client) => {
            client
                .run(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
                .await
        }
    }
}

async fn write_line(writer: &mut ServerSink, line: &str) -> io::Result<()> {
    writer.write_all(format!("{}\n", line).as_bytes()).await?;
    writer.flush().await
}

async fn print_line<O>(output: &Mutex<O>, line: &str) -> io::Result<()>
where
    O: AsyncWrite + Unpin,
{
    let mut output = output.lock().await;
    output.write_all(format!("{}\n", line).as_bytes()).await?;
    output.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio_test::io::Builder;

    const WELCOME: &str = "Hello, alice! The server is ready to process your connection.";

    /// Server side of an in-memory connection
    struct FakeServer {
        lines: Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{}\n", line).as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> Option<String> {
            self.lines.next_line().await.unwrap()
        }
    }

    async fn accepted_client() -> (Client, FakeServer) {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(client_io);
        let (server_reader, server_writer) = tokio::io::split(server_io);
        let mut server = FakeServer {
            lines: BufReader::new(server_reader).lines(),
            writer: server_writer,
        };

        server.send(WELCOME).await;
        let client = match Client::handshake(reader, writer, "alice").await.unwrap() {
            Handshake::Accepted(client) => client,
            Handshake::Rejected(reply) => panic!("Unexpected rejection: {:?}", reply),
        };
        assert_eq!(server.recv().await.as_deref(), Some("alice"));

        (client, server)
    }

    #[test]
    fn test_client_config_address() {
        let config = ClientConfig::new("10.0.0.1", 6969, "alice");
        assert_eq!(config.address(), "10.0.0.1:6969");
    }

    #[test]
    fn test_rejection_messages() {
        assert_eq!(
            rejection_message(&HandshakeReply::UsernameInvalid),
            "Username is invalid."
        );
        assert_eq!(
            rejection_message(&HandshakeReply::UserAlreadyExists),
            "Username already in use."
        );
    }

    #[tokio::test]
    async fn test_handshake_accepted() {
        let reader = Builder::new().read(format!("{}\n", WELCOME).as_bytes()).build();
        let writer = Builder::new().write(b"alice\n").build();

        match Client::handshake(reader, writer, "alice").await.unwrap() {
            Handshake::Accepted(client) => {
                assert_eq!(client.username(), "alice");
                assert_eq!(client.welcome(), WELCOME);
            }
            Handshake::Rejected(reply) => panic!("Unexpected rejection: {:?}", reply),
        }
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let reader = Builder::new().read(b"USER_ALREADY_EXISTS\n").build();
        let writer = Builder::new().write(b"alice\n").build();

        match Client::handshake(reader, writer, "alice").await.unwrap() {
            Handshake::Rejected(reply) => assert_eq!(reply, HandshakeReply::UserAlreadyExists),
            Handshake::Accepted(_) => panic!("Duplicate username should be rejected"),
        }
    }

    #[tokio::test]
    async fn test_handshake_invalid_username() {
        let reader = Builder::new().read(b"USERNAME_INVALID\r\n").build();
        let writer = Builder::new().write(b"   \n").build();

        match Client::handshake(reader, writer, "   ").await.unwrap() {
            Handshake::Rejected(reply) => assert_eq!(reply, HandshakeReply::UsernameInvalid),
            Handshake::Accepted(_) => panic!("Blank username should be rejected"),
        }
    }

    #[tokio::test]
    async fn test_handshake_connection_closed() {
        let reader = Builder::new().build();
        let writer = Builder::new().write(b"alice\n").build();

        let result = Client::handshake(reader, writer, "alice").await;
        assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_run_sends_lines_until_quit() {
        let (client, mut server) = accepted_client().await;
        let (output, mut screen) = tokio::io::duplex(1024);
        let input = Builder::new().read(b"hello\nQuit\nnever sent\n").build();

        server.send("bob: hi alice").await;
        client.run(BufReader::new(input), output).await.unwrap();

        assert_eq!(server.recv().await.as_deref(), Some("hello"));
        assert_eq!(server.recv().await.as_deref(), Some("Quit"));

        // Hanging up lets the detached printer finish and release the screen
        drop(server);
        let mut printed = String::new();
        screen.read_to_string(&mut printed).await.unwrap();

        let printed: Vec<&str> = printed.lines().collect();
        assert_eq!(printed[0], WELCOME);
        assert!(printed.contains(&"bob: hi alice"));
        assert!(printed.contains(&CLOSING_MESSAGE));
        assert!(printed.contains(&SERVER_CLOSED_MESSAGE));
        assert!(!printed.contains(&"never sent"));
    }

    #[tokio::test]
    async fn test_run_stops_at_end_of_input() {
        let (client, mut server) = accepted_client().await;
        let input = Builder::new().read(b"only line\n").build();

        client
            .run(BufReader::new(input), tokio::io::sink())
            .await
            .unwrap();

        assert_eq!(server.recv().await.as_deref(), Some("only line"));
    }

    #[tokio::test]
    async fn test_run_stops_when_server_closes() {
        let (client, server) = accepted_client().await;
        let (output, mut screen) = tokio::io::duplex(1024);
        let (_keyboard, input) = tokio::io::duplex(64);

        drop(server);
        client.run(BufReader::new(input), output).await.unwrap();

        let mut printed = String::new();
        screen.read_to_string(&mut printed).await.unwrap();
        assert_eq!(printed, format!("{}\n{}\n", WELCOME, SERVER_CLOSED_MESSAGE));
    }
}
