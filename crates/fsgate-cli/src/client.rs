//! Thin typed client over the control channel.

use crate::CliError;
use fsgate_core::rule::Rule;
use fsgate_core::status::OpStatus;
use fsgate_core::version::CoreVersion;
use tokio::net::TcpStream;
use wire::{read_reply, write_request, Reply, ReplyPayload, Request};

pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub async fn connect(addr: &str) -> Result<Self, CliError> {
        let stream = TcpStream::connect(addr).await.map_err(CliError::Connect)?;
        Ok(Client { stream })
    }

    async fn call(&mut self, request: Request) -> Result<(OpStatus, Vec<u8>), CliError> {
        write_request(&mut self.stream, &request).await?;
        let (code, payload) = read_reply(&mut self.stream).await?;
        if !code.is_success() {
            return Err(CliError::Failed(code));
        }
        Ok((code, payload))
    }

    pub async fn core_version(&mut self) -> Result<CoreVersion, CliError> {
        let (code, payload) = self.call(Request::GetCoreVersion).await?;
        match Reply::decode_version(code, &payload)?.payload {
            ReplyPayload::Version(v) => Ok(v),
            _ => Err(CliError::Failed(OpStatus::INVALID_PARAMETER)),
        }
    }

    pub async fn set_unload_acceptable(&mut self, value: bool) -> Result<(), CliError> {
        self.call(Request::SetUnloadAcceptable(value)).await.map(|_| ())
    }

    pub async fn set_detach_acceptable(&mut self, value: bool) -> Result<(), CliError> {
        self.call(Request::SetDetachAcceptable(value)).await.map(|_| ())
    }

    pub async fn add_rules(&mut self, rules: Vec<Rule>) -> Result<u32, CliError> {
        let (code, payload) = self.call(Request::AddRules(rules)).await?;
        self.count_of(code, &payload)
    }

    pub async fn remove_rules(&mut self, rules: Vec<Rule>) -> Result<u32, CliError> {
        let (code, payload) = self.call(Request::RemoveRules(rules)).await?;
        self.count_of(code, &payload)
    }

    pub async fn query_rules(&mut self) -> Result<Vec<Rule>, CliError> {
        let (code, payload) = self.call(Request::QueryRules).await?;
        self.rules_of(code, &payload)
    }

    pub async fn check_matched(&mut self, path: &str) -> Result<Vec<Rule>, CliError> {
        let (code, payload) = self.call(Request::CheckMatchedRule(path.to_string())).await?;
        self.rules_of(code, &payload)
    }

    pub async fn cleanup_rules(&mut self) -> Result<u32, CliError> {
        let (code, payload) = self.call(Request::CleanupRules).await?;
        self.count_of(code, &payload)
    }

    fn count_of(&self, code: OpStatus, payload: &[u8]) -> Result<u32, CliError> {
        match Reply::decode_count(code, payload)?.payload {
            ReplyPayload::AffectedCount(n) => Ok(n),
            _ => Err(CliError::Failed(OpStatus::INVALID_PARAMETER)),
        }
    }

    fn rules_of(&self, code: OpStatus, payload: &[u8]) -> Result<Vec<Rule>, CliError> {
        match Reply::decode_rules(code, payload)?.payload {
            ReplyPayload::Rules(rules) => Ok(rules),
            _ => Err(CliError::Failed(OpStatus::INVALID_PARAMETER)),
        }
    }
}
