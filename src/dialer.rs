//! Outbound calls: precomputed originate attempts tried one after another.

use crate::registry::{
    CallRequest, CallRequestStatus, Callback, Job, JobResult, SwitchInstance,
};
use crate::signal::{Signal, SignalProducer};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// One route to try, `retries` times in a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySpec {
    /// Dial-string prefix, e.g. `sofia/gateway/carrier/`.
    pub gateway: String,
    #[serde(default)]
    pub codecs: Option<String>,
    /// Ring timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_retries() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequestSpec {
    pub to: String,
    pub from: String,
    #[serde(default)]
    pub caller_name: Option<String>,
    pub answer_url: String,
    #[serde(default)]
    pub hangup_url: Option<String>,
    #[serde(default)]
    pub ring_url: Option<String>,
    pub gateways: Vec<GatewaySpec>,
    /// Raw `name=value` channel variables added to every attempt.
    #[serde(default)]
    pub extra_vars: Vec<String>,
}

impl CallRequestSpec {
    fn channel_vars(&self, request_uuid: &str, gateway: &GatewaySpec) -> Vec<String> {
        let mut vars = vec![
            format!("flowswitch_request_uuid={}", request_uuid),
            format!("flowswitch_answer_url={}", self.answer_url),
            format!("origination_caller_id_number={}", self.from),
        ];
        if let Some(url) = &self.hangup_url {
            vars.push(format!("flowswitch_hangup_url={}", url));
        }
        if let Some(url) = &self.ring_url {
            vars.push(format!("flowswitch_ring_url={}", url));
        }
        if let Some(name) = &self.caller_name {
            vars.push(format!("origination_caller_id_name='{}'", name));
        }
        if let Some(timeout) = gateway.timeout {
            vars.push(format!("originate_timeout={}", timeout));
        }
        if let Some(codecs) = gateway.codecs.as_deref().filter(|c| !c.is_empty()) {
            vars.push(format!("absolute_codec_string=^^:{}", codecs.replace(',', ":")));
        }
        vars.extend(self.extra_vars.iter().cloned());
        vars
    }

    /// Every originate command for this request, in the order they are tried.
    pub fn dial_strings(&self, request_uuid: &str) -> Vec<String> {
        let mut attempts = Vec::new();
        for gateway in &self.gateways {
            let command = format!(
                "originate {{{}}}{}{} &park()",
                self.channel_vars(request_uuid, gateway).join(","),
                gateway.gateway,
                self.to
            );
            for _ in 0..gateway.retries.max(1) {
                attempts.push(command.clone());
            }
        }
        attempts
    }

    pub fn build(&self, request_uuid: &str, method: &str) -> CallRequest {
        let callback = |url: &Option<String>| url.as_ref().map(|u| Callback::new(u.clone(), method));
        CallRequest::new(
            request_uuid,
            self.to.clone(),
            self.from.clone(),
            self.answer_url.clone(),
            self.dial_strings(request_uuid),
        )
        .with_callbacks(callback(&self.hangup_url), callback(&self.ring_url))
    }
}

/// Drives a [`CallRequest`] through its attempts until one is accepted by
/// the switch or none are left.
pub struct Dialer {
    signals: Arc<SignalProducer>,
    job_timeout: Duration,
}

impl Dialer {
    pub fn new(signals: Arc<SignalProducer>, job_timeout: Duration) -> Self {
        Self {
            signals,
            job_timeout,
        }
    }

    /// Issue one attempt and wait for its background job.
    async fn attempt(
        &self,
        instance: &Arc<SwitchInstance>,
        request: &CallRequest,
        command: &str,
    ) -> Result<JobResult> {
        let Some(job_id) = instance.client().bg_command(command).await? else {
            warn!(request_uuid = %request.id(), "switch returned no job id");
            return Ok(JobResult::Err("NO_JOB_ID".to_string()));
        };
        let (job, receiver) = Job::new(job_id.clone(), command, Some(request.id().to_string()));
        instance.add_job(Arc::new(job));
        request.set_job(Some(job_id.clone()));

        let result = match tokio::time::timeout(self.job_timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => JobResult::Err("JOB_ABANDONED".to_string()),
            Err(_) => JobResult::Err("JOB_TIMEOUT".to_string()),
        };
        instance.remove_job(&job_id);
        Ok(result)
    }

    pub async fn run(&self, instance: Arc<SwitchInstance>, request: Arc<CallRequest>) {
        while let Some(command) = request.next_dial_string() {
            info!(
                request_uuid = %request.id(),
                remaining = request.remaining(),
                "originating"
            );
            let result = match self.attempt(&instance, &request, &command).await {
                Ok(result) => result,
                Err(e) => JobResult::Err(format!("{}", e)),
            };
            match result {
                JobResult::Ok(leg) => {
                    info!(request_uuid = %request.id(), leg = %leg, "originate accepted");
                    request.finish(CallRequestStatus::Succeeded);
                    instance.remove_call_request(request.id());
                    return;
                }
                JobResult::Err(cause) => {
                    warn!(request_uuid = %request.id(), cause = %cause, "originate failed");
                    request.record_failure(cause);
                }
            }
        }

        let cause = request
            .last_cause()
            .unwrap_or_else(|| "NORMAL_TEMPORARY_FAILURE".to_string());
        error!(
            request_uuid = %request.id(),
            to = %request.to,
            cause = %cause,
            "all originate attempts failed"
        );
        request.finish(CallRequestStatus::Failed(cause.clone()));
        if let Some(callback) = &request.hangup {
            self.signals.dispatch(
                Signal::RequestHangup {
                    callback: callback.clone(),
                    request_uuid: request.id().to_string(),
                    to: request.to.clone(),
                    from: request.from.clone(),
                    cause,
                },
                None,
            );
        }
        instance.remove_call_request(request.id());
    }
}
