use russh::Channel;
use russh::client::Msg;
use tokio::time::error::Elapsed;

use super::*;

/// Where a command's output ended.
enum Ending {
    Prompt,
    Expected,
}

impl ShellClient {
    /// Connects, opens a shell and waits for the first prompt.
    pub(super) async fn connect(
        params: &ConnectParams,
        handler: DeviceHandler,
        security: &ConnectionSecurityOptions,
        transcript: Transcript,
    ) -> Result<ShellClient, SessionError> {
        let address = format!("{}@{}:{}", params.username, params.host, params.port);

        let config = Config {
            preferred: security.preferred(),
            inactivity_timeout: Some(params.command_timeout.max(Duration::from_secs(60))),
            ..Default::default()
        };

        let client = Client::connect_with_config(
            (params.host.clone(), params.port),
            &params.username,
            AuthMethod::with_password(&params.password),
            security.server_check.clone(),
            config,
        )
        .await?;
        debug!("{} TCP connection successful", address);

        let mut channel = match open_shell(&client).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(err) = client.disconnect().await {
                    debug!("{} Disconnect after failed shell request: {:?}", address, err);
                }
                return Err(e);
            }
        };
        debug!("{} Shell request successful", address);

        let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<String>(256);
        let (sender_to_user, mut receiver_from_shell) = mpsc::channel::<String>(256);

        let io_address = address.clone();
        let io_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(data) = receiver_from_user.recv() => {
                        if let Err(e) = channel.data(data.as_bytes()).await {
                            debug!("{} Failed to send data to shell: {:?}", io_address, e);
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } => {
                                let text = String::from_utf8_lossy(data);
                                transcript.append(&text);
                                if sender_to_user.send(text.into_owned()).await.is_err() {
                                    debug!("{} Shell output receiver dropped", io_address);
                                    break;
                                }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{} Shell exited with status {}", io_address, exit_status);
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{} Shell sent EOF", io_address);
                                break;
                            }
                            _ => {}
                        }
                    },
                    else => break,
                }
            }
            debug!("{} SSH I/O task ended", io_address);
        });

        let mut shell = Self {
            client: Arc::new(client),
            sender: sender_to_shell,
            recv: receiver_from_shell,
            handler,
            address,
            io_task,
            closed: false,
        };
        shell.wait_for_prompt(params.connect_timeout).await?;
        debug!(
            "{} Initial prompt {:?}",
            shell.address,
            shell.handler.current_prompt()
        );
        Ok(shell)
    }

    /// Reads the login banner until the device prompt shows up, answering
    /// any input the platform expects on the way.
    async fn wait_for_prompt(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let handler = &mut self.handler;
        let recv = &mut self.recv;
        let sender = &self.sender;
        let mut buffer = String::new();

        let wait: Result<Result<(), SessionError>, Elapsed> = tokio::time::timeout(timeout, async {
            loop {
                let Some(data) = recv.recv().await else {
                    return Err(SessionError::ChannelDisconnected);
                };
                trace!("{:?}", data);
                buffer.push_str(&ANSI_ESCAPE.replace_all(&data, ""));

                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    handler.read(line.trim_end());
                }

                if buffer.is_empty() {
                    continue;
                }
                if handler.read(&buffer) == LineKind::Prompt {
                    return Ok(());
                }
                if let Some(keys) = handler.read_need_write(&buffer) {
                    buffer.clear();
                    sender
                        .send(keys)
                        .await
                        .map_err(|_| SessionError::ChannelDisconnected)?;
                }
            }
        })
        .await;

        match wait {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(format!(
                "{}: waiting for initial prompt",
                self.address
            ))),
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.client.is_closed()
    }

    /// Sends a command and collects its output.
    ///
    /// Output ends at the first match of `expect` when given, otherwise at
    /// the next device prompt. Pagination markers are answered and dropped.
    /// The echoed command and the closing prompt are stripped.
    pub(super) async fn write(
        &mut self,
        command: &str,
        expect: Option<&Regex>,
        timeout: Duration,
    ) -> Result<String, SessionError> {
        while self.recv.try_recv().is_ok() {}

        self.sender
            .send(format!("{command}\n"))
            .await
            .map_err(|_| SessionError::ChannelDisconnected)?;

        let handler = &mut self.handler;
        let recv = &mut self.recv;
        let sender = &self.sender;
        let mut output = String::new();
        let mut line_buffer = String::new();

        let result: Result<Result<Ending, SessionError>, Elapsed> =
            tokio::time::timeout(timeout, async {
                loop {
                    let Some(data) = recv.recv().await else {
                        return Err(SessionError::ChannelDisconnected);
                    };
                    line_buffer.push_str(&ANSI_ESCAPE.replace_all(&data, ""));

                    while let Some(pos) = line_buffer.find('\n') {
                        let raw: String = line_buffer.drain(..=pos).collect();
                        let line = IGNORE_START_LINE.replace(&raw, "");
                        let line = line.trim_end_matches(['\r', '\n']);
                        if let LineKind::More(keys) = handler.read(line) {
                            sender
                                .send(keys)
                                .await
                                .map_err(|_| SessionError::ChannelDisconnected)?;
                            continue;
                        }
                        output.push_str(line);
                        output.push('\n');
                    }

                    if let Some(expect) = expect
                        && (expect.is_match(&output) || expect.is_match(&line_buffer))
                    {
                        return Ok(Ending::Expected);
                    }

                    if line_buffer.is_empty() {
                        continue;
                    }
                    let tail = IGNORE_START_LINE.replace(&line_buffer, "").into_owned();
                    match handler.read(&tail) {
                        LineKind::Prompt if expect.is_none() => return Ok(Ending::Prompt),
                        LineKind::More(keys) => {
                            line_buffer.clear();
                            trace!("Answering pagination with {:?}", keys);
                            sender
                                .send(keys)
                                .await
                                .map_err(|_| SessionError::ChannelDisconnected)?;
                        }
                        LineKind::Input(keys) => {
                            output.push_str(&tail);
                            line_buffer.clear();
                            trace!("Input required after {:?}", tail);
                            sender
                                .send(keys)
                                .await
                                .map_err(|_| SessionError::ChannelDisconnected)?;
                        }
                        _ => {}
                    }
                }
            })
            .await;

        let ending = match result {
            Ok(ending) => ending?,
            Err(_) => {
                return Err(SessionError::Timeout(format!(
                    "{}: waiting for prompt after '{}'",
                    self.address, command
                )));
            }
        };

        if let Ending::Expected = ending {
            output.push_str(&line_buffer);
        }

        let content = output
            .strip_prefix(command)
            .map(|rest| rest.trim_start_matches(['\r', '\n']))
            .unwrap_or(output.as_str());
        Ok(content.trim_end().to_string())
    }

    /// Leaves the shell and disconnects. Errors are ignored; the connection
    /// is dropped anyway.
    pub(super) async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        debug!(
            "{} Closing SSH session at {:?}",
            self.address,
            self.handler.current_prompt()
        );
        self.recv.close();

        if self.is_connected() {
            if let Err(e) = self.sender.send("exit\n".to_string()).await {
                debug!("{} Failed to send exit: {:?}", self.address, e);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Err(e) = self.client.disconnect().await {
                debug!("{} Disconnect failed: {:?}", self.address, e);
            }
        }
        self.io_task.abort();
    }
}

/// Sessions dropped without `close`, by cancellation or an error path, are
/// disconnected in the background.
impl Drop for ShellClient {
    fn drop(&mut self) {
        self.io_task.abort();
        if self.closed || self.client.is_closed() {
            return;
        }
        debug!("{} Dropped without close, disconnecting", self.address);
        let client = self.client.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = client.disconnect().await;
            });
        }
    }
}

async fn open_shell(client: &Client) -> Result<Channel<Msg>, SessionError> {
    let channel = client.get_channel().await?;
    channel
        .request_pty(false, "xterm", 800, 600, 0, 0, &[])
        .await?;
    channel.request_shell(false).await?;
    Ok(channel)
}
