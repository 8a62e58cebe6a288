use crate::coach::ConnectionState;
use crate::state::{AppState, MetricsSnapshot};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let session = state.coach.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-coach-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "session": {
            "state": session.state,
            "session_id": session.session_id,
            "last_error": session.last_error
        },
        "backend": {
            "endpoint": config.backend.endpoint,
            "model_id": config.backend.model_id
        },
        "audio": {
            "capture": config.audio.capture,
            "output": config.audio.output,
            "input_sample_rate": config.audio.input_sample_rate,
            "output_sample_rate": config.audio.output_sample_rate
        },
        "metrics": metrics,
        "memory": get_memory_info(),
        "system": get_system_status(session.state, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "state": state.coach.state(),
        "pipeline": metrics,
        "derived": {
            "frame_discard_rate": metrics.frame_discard_rate(),
            "capture_drop_rate": metrics.capture_drop_rate(),
            "chunk_drop_rate": if metrics.chunks_scheduled + metrics.chunks_dropped > 0 {
                metrics.chunks_dropped as f64 / (metrics.chunks_scheduled + metrics.chunks_dropped) as f64
            } else {
                0.0
            },
            "frames_per_second": if uptime_seconds > 0 {
                metrics.frames_sent as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {}", process::id())
    })
}

fn get_system_status(state: ConnectionState, metrics: &MetricsSnapshot) -> serde_json::Value {
    let mut warnings = Vec::new();
    if state == ConnectionState::Error {
        warnings.push("Last session ended with an error - see session.last_error");
    }
    if metrics.frame_discard_rate() > 0.05 {
        warnings.push("Uplink frames are being discarded after session close");
    }
    if metrics.capture_drop_rate() > 0.05 {
        warnings.push("Capture frames are being dropped - the uplink cannot keep up");
    }
    if metrics.teardown_failures > 0 {
        warnings.push("Some teardown steps failed - audio devices may need a restart");
    }

    json!({
        "status": if warnings.is_empty() { "normal" } else { "degraded" },
        "warnings": warnings
    })
}
