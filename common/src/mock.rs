use std::collections::VecDeque;

use crate::{
    connection::{ConnectError, StationLink},
    poll::{PollError, StatePoller, StateReply},
};

#[derive(Debug, Clone)]
pub struct ScriptedStation {
    associate_after: Option<u32>,
    reject: Option<String>,
    polls: u32,
    joined: Option<(String, String)>,
    aborted: bool,
}

impl ScriptedStation {
    pub fn associates_after(polls: u32) -> Self {
        Self {
            associate_after: Some(polls),
            reject: None,
            polls: 0,
            joined: None,
            aborted: false,
        }
    }

    pub fn never_associates() -> Self {
        Self {
            associate_after: None,
            ..Self::associates_after(0)
        }
    }

    pub fn rejecting(reason: &str) -> Self {
        Self {
            reject: Some(reason.to_string()),
            ..Self::never_associates()
        }
    }

    pub fn joined_with(&self) -> Option<(&str, &str)> {
        self.joined
            .as_ref()
            .map(|(ssid, pass)| (ssid.as_str(), pass.as_str()))
    }

    pub fn status_polls(&self) -> u32 {
        self.polls
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }
}

impl StationLink for ScriptedStation {
    fn begin(&mut self, ssid: &str, passphrase: &str) -> Result<(), ConnectError> {
        if let Some(reason) = &self.reject {
            return Err(ConnectError::Rejected(reason.clone()));
        }
        self.joined = Some((ssid.to_string(), passphrase.to_string()));
        Ok(())
    }

    fn is_associated(&mut self) -> bool {
        self.polls += 1;
        self.associate_after
            .is_some_and(|after| self.joined.is_some() && self.polls >= after)
    }

    fn abort(&mut self) {
        self.aborted = true;
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedPoller {
    replies: VecDeque<Result<StateReply, PollError>>,
    requests: Vec<String>,
}

impl ScriptedPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&mut self, status: u16, body: &str) -> &mut Self {
        self.replies.push_back(Ok(StateReply::new(status, body)));
        self
    }

    pub fn fail(&mut self, error: PollError) -> &mut Self {
        self.replies.push_back(Err(error));
        self
    }

    pub fn requests(&self) -> &[String] {
        &self.requests
    }
}

impl StatePoller for ScriptedPoller {
    fn fetch(&mut self, url: &str) -> Result<StateReply, PollError> {
        self.requests.push(url.to_string());
        self.replies
            .pop_front()
            .unwrap_or_else(|| Err(PollError::Transport("connection refused".to_string())))
    }
}
