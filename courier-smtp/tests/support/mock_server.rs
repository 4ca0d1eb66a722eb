//! Mock submission server for exercising the SMTP transport.
#![allow(dead_code)] // Test utility module - not all methods used in every test
//!
//! Speaks just enough ESMTP for a submission session: EHLO/HELO, AUTH PLAIN
//! and LOGIN, MAIL, RCPT, DATA, NOOP, RSET and QUIT. Every command line is
//! recorded so tests can assert on the exact conversation.

use std::{net::SocketAddr, sync::Arc};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::JoinHandle,
};

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    message: String,
}

impl Reply {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn render(&self) -> String {
        format!("{} {}\r\n", self.code, self.message)
    }
}

#[derive(Debug, Clone)]
struct Config {
    capabilities: Vec<String>,
    username: String,
    password: String,
    rcpt_reply: Reply,
    data_end_reply: Reply,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capabilities: vec!["SIZE 10000000".to_string(), "AUTH PLAIN LOGIN".to_string()],
            username: "user@example.com".to_string(),
            password: "secret".to_string(),
            rcpt_reply: Reply::new(250, "2.1.5 OK"),
            data_end_reply: Reply::new(250, "2.0.0 Queued"),
        }
    }
}

/// Everything the server saw on every connection, in order.
#[derive(Debug, Default)]
pub struct Recording {
    pub commands: Vec<String>,
    pub messages: Vec<String>,
    pub connections: usize,
}

pub struct MockSubmissionServer {
    addr: SocketAddr,
    recording: Arc<Mutex<Recording>>,
    accept_loop: JoinHandle<()>,
}

impl MockSubmissionServer {
    #[must_use]
    pub fn builder() -> MockSubmissionServerBuilder {
        MockSubmissionServerBuilder {
            config: Config::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<String> {
        self.recording.lock().await.commands.clone()
    }

    pub async fn messages(&self) -> Vec<String> {
        self.recording.lock().await.messages.clone()
    }

    pub async fn connections(&self) -> usize {
        self.recording.lock().await.connections
    }

    async fn serve(
        stream: TcpStream,
        config: Arc<Config>,
        recording: Arc<Mutex<Recording>>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer.write_all(b"220 mock.example.com ESMTP ready\r\n").await?;

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let command = line.trim_end().to_string();
            recording.lock().await.commands.push(command.clone());

            let verb = command
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase();

            let reply = match verb.as_str() {
                "EHLO" => {
                    let mut lines = vec!["mock.example.com".to_string()];
                    lines.extend(config.capabilities.iter().cloned());
                    let last = lines.len() - 1;
                    lines
                        .iter()
                        .enumerate()
                        .map(|(i, text)| {
                            let separator = if i == last { ' ' } else { '-' };
                            format!("250{separator}{text}\r\n")
                        })
                        .collect::<String>()
                }
                "HELO" | "MAIL" | "RSET" | "NOOP" => Reply::new(250, "OK").render(),
                "RCPT" => config.rcpt_reply.render(),
                "AUTH" => Self::authenticate(&command, &config, &mut reader, &mut writer).await?,
                "DATA" => {
                    writer
                        .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                        .await?;
                    let mut content = String::new();
                    loop {
                        line.clear();
                        if reader.read_line(&mut line).await? == 0 {
                            return Ok(());
                        }
                        if line == ".\r\n" {
                            break;
                        }
                        content.push_str(&line);
                    }
                    recording.lock().await.messages.push(content);
                    config.data_end_reply.render()
                }
                "QUIT" => {
                    writer.write_all(b"221 Bye\r\n").await?;
                    return Ok(());
                }
                _ => Reply::new(500, "Unknown command").render(),
            };

            writer.write_all(reply.as_bytes()).await?;
        }
    }

    async fn authenticate(
        command: &str,
        config: &Config,
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        writer: &mut tokio::net::tcp::OwnedWriteHalf,
    ) -> std::io::Result<String> {
        let decode = |token: &str| {
            STANDARD
                .decode(token.trim())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_default()
        };
        let accepted = Reply::new(235, "2.7.0 Authentication successful").render();
        let rejected = Reply::new(535, "5.7.8 Authentication credentials invalid").render();

        let mut parts = command.split_whitespace().skip(1);
        match parts.next().map(str::to_ascii_uppercase).as_deref() {
            Some("PLAIN") => {
                let expected = format!("\0{}\0{}", config.username, config.password);
                let given = decode(parts.next().unwrap_or_default());
                Ok(if given == expected { accepted } else { rejected })
            }
            Some("LOGIN") => {
                let mut line = String::new();
                writer.write_all(b"334 VXNlcm5hbWU6\r\n").await?;
                reader.read_line(&mut line).await?;
                let username = decode(&line);

                line.clear();
                writer.write_all(b"334 UGFzc3dvcmQ6\r\n").await?;
                reader.read_line(&mut line).await?;
                let password = decode(&line);

                Ok(
                    if username == config.username && password == config.password {
                        accepted
                    } else {
                        rejected
                    },
                )
            }
            _ => Ok(Reply::new(504, "5.5.4 Unrecognized authentication type").render()),
        }
    }
}

impl Drop for MockSubmissionServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

pub struct MockSubmissionServerBuilder {
    config: Config,
}

impl MockSubmissionServerBuilder {
    /// Replaces the EHLO keyword lines.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.config.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.config.username = username.to_string();
        self.config.password = password.to_string();
        self
    }

    #[must_use]
    pub fn with_rcpt_reply(mut self, code: u16, message: &str) -> Self {
        self.config.rcpt_reply = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_data_end_reply(mut self, code: u16, message: &str) -> Self {
        self.config.data_end_reply = Reply::new(code, message);
        self
    }

    pub async fn start(self) -> std::io::Result<MockSubmissionServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let config = Arc::new(self.config);
        let recording = Arc::new(Mutex::new(Recording::default()));

        let accept_loop = tokio::spawn({
            let recording = Arc::clone(&recording);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    recording.lock().await.connections += 1;
                    let config = Arc::clone(&config);
                    let recording = Arc::clone(&recording);
                    tokio::spawn(async move {
                        let _ = MockSubmissionServer::serve(stream, config, recording).await;
                    });
                }
            }
        });

        Ok(MockSubmissionServer {
            addr,
            recording,
            accept_loop,
        })
    }
}
