// ABOUTME: Scripted fake modem for tests: answers AT commands through a closure over an in-memory pipe
// ABOUTME: Records every command it sees and can push unsolicited codes or hang up mid-session

use super::channel::{AsyncStream, ModemPort};
use crate::error::{SmsError, SmsResult};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::mpsc;

type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

enum Control {
    Unsolicited(String),
    HangUp,
}

/// Fake modem; every `connect` starts a new session sharing the same script
#[derive(Clone)]
pub(crate) struct ScriptedModem {
    responder: Responder,
    commands: Arc<Mutex<Vec<String>>>,
    sessions: Arc<Mutex<Vec<mpsc::UnboundedSender<Control>>>>,
    refuse: Arc<AtomicBool>,
}

impl ScriptedModem {
    pub(crate) fn new(responder: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        ScriptedModem {
            responder: Arc::new(responder),
            commands: Arc::default(),
            sessions: Arc::default(),
            refuse: Arc::default(),
        }
    }

    pub(crate) fn connect(&self) -> Box<dyn AsyncStream> {
        let (ours, theirs) = duplex(16 * 1024);
        let (control, inbox) = mpsc::unbounded_channel();
        lock(&self.sessions).push(control);
        tokio::spawn(serve(
            theirs,
            Arc::clone(&self.responder),
            Arc::clone(&self.commands),
            inbox,
        ));
        Box::new(ours)
    }

    /// Commands received so far, CR and leading escape sequences stripped
    pub(crate) fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    pub(crate) fn clear_commands(&self) {
        lock(&self.commands).clear();
    }

    /// Emit an unsolicited line on every live session
    pub(crate) fn unsolicited(&self, line: &str) {
        for session in lock(&self.sessions).iter() {
            let _ = session.send(Control::Unsolicited(line.to_string()));
        }
    }

    /// Drop every live session; with `refuse` new opens fail too
    pub(crate) fn hang_up(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
        for session in lock(&self.sessions).drain(..) {
            let _ = session.send(Control::HangUp);
        }
    }

    pub(crate) fn sessions_opened(&self) -> usize {
        lock(&self.sessions).len()
    }
}

#[async_trait]
impl ModemPort for ScriptedModem {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn open(&self) -> SmsResult<Box<dyn AsyncStream>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SmsError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "modem unplugged",
            )));
        }
        Ok(self.connect())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn serve(
    mut stream: DuplexStream,
    responder: Responder,
    commands: Arc<Mutex<Vec<String>>>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        tokio::select! {
            read = stream.read(&mut chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                pending.extend_from_slice(&chunk[..n]);
                while let Some(end) = pending.iter().position(|b| *b == b'\r' || *b == 0x1a) {
                    let piece: Vec<u8> = pending.drain(..=end).collect();
                    let text = String::from_utf8_lossy(&piece);
                    let command = text
                        .trim_end_matches('\r')
                        .trim_start_matches('\u{1b}')
                        .trim_start_matches("+++")
                        .to_string();
                    if command.is_empty() {
                        continue;
                    }
                    lock(&commands).push(command.clone());

                    let Some(reply) = responder(&command) else {
                        continue;
                    };
                    let framed = if reply.starts_with('>') {
                        format!("\r\n{reply}")
                    } else {
                        format!("\r\n{reply}\r\n")
                    };
                    if stream.write_all(framed.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
            message = control.recv() => match message {
                Some(Control::Unsolicited(line)) => {
                    if stream.write_all(format!("\r\n{line}\r\n").as_bytes()).await.is_err() {
                        return;
                    }
                }
                Some(Control::HangUp) | None => return,
            },
        }
    }
}

/// Answers of a healthy GSM modem with an empty inbox
pub(crate) fn standard_reply(command: &str) -> Option<String> {
    let reply = match command {
        c if c.ends_with('\u{1a}') => "+CMGS: 42\r\n\r\nOK",
        c if c.starts_with("AT+CMGS") => "> ",
        "AT+CPIN?" => "+CPIN: READY\r\n\r\nOK",
        "AT+CPMS=?" => "+CPMS: (\"SM\",\"ME\"),(\"SM\",\"ME\"),(\"SM\",\"ME\")\r\n\r\nOK",
        c if c.starts_with("AT+CPMS=") => "+CPMS: 0,30,0,30,0,30\r\n\r\nOK",
        "AT+CNMI=?" => "+CNMI: (0-3),(0-3),(0,2),(0-2),(0,1)\r\n\r\nOK",
        "AT+CSQ" => "+CSQ: 21,99\r\n\r\nOK",
        "AT+CREG?" => "+CREG: 1,1\r\n\r\nOK",
        _ => "OK",
    };
    Some(reply.to_string())
}
