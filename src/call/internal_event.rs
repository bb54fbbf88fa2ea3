//! Metrics and matching log events emitted by the call pipeline.
//!
//! Instruments go through the `metrics` facade; nothing is recorded unless the
//! host process installs a recorder.

use metrics::{counter, gauge, histogram};

pub(crate) struct InFlightGauge<'a> {
    pub service: &'a str,
    pub node: usize,
}

impl InFlightGauge<'_> {
    pub fn emit(&self, in_flight: usize) {
        gauge!(
            "mesh_call_in_flight",
            "service" => self.service.to_owned(),
            "node" => self.node.to_string()
        )
        .set(in_flight as f64);
        trace!(target: "mesh_call::stats", service = self.service, node = self.node, in_flight, "In-flight updated");
    }
}

pub(crate) struct GateRejected<'a> {
    pub gate: &'static str,
    pub service: &'a str,
    pub action: &'a str,
    pub node: &'a str,
}

impl GateRejected<'_> {
    pub fn emit(&self) {
        counter!("mesh_call_gate_rejections_total", "gate" => self.gate).increment(1);
        warn!(
            gate = self.gate,
            service = self.service,
            action = self.action,
            node = self.node,
            "Call rejected by gate"
        );
    }
}

pub(crate) struct CallCompleted<'a> {
    pub service: &'a str,
    pub action: &'a str,
    pub status: u16,
    pub attempts: usize,
}

impl CallCompleted<'_> {
    pub fn emit(&self) {
        counter!(
            "mesh_call_requests_total",
            "service" => self.service.to_owned(),
            "action" => self.action.to_owned(),
            "status" => self.status.to_string()
        )
        .increment(1);
        histogram!("mesh_call_retry_attempts", "service" => self.service.to_owned())
            .record(self.attempts as f64);
        debug!(
            service = self.service,
            action = self.action,
            status = self.status,
            attempts = self.attempts,
            "Call completed"
        );
    }
}
