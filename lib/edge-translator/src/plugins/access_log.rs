//! Access logging configured on a listener

use super::{ListenerPlugin, Params};
use crate::{Result, TranslateError};
use edge_api::v1::options::{AccessLogOutput, FileFormat};
use edge_api::v1::proxy::Listener;
use edge_api::xds;

pub struct AccessLogPlugin;

impl ListenerPlugin for AccessLogPlugin {
    fn name(&self) -> &'static str {
        "access_log"
    }

    fn process_listener(&self, _params: &Params<'_>, listener: &Listener, out: &mut xds::Listener) -> Result<()> {
        let Some(als) = &listener.options.access_logging_service else {
            return Ok(());
        };
        for log in &als.access_log {
            match &log.output {
                AccessLogOutput::File(file) => {
                    if file.path.is_empty() {
                        return Err(TranslateError::InvalidConfiguration(
                            "file access log requires a path".into(),
                        ));
                    }
                    if let Some(FileFormat::JsonFormat(fields)) = &file.format {
                        if fields.is_empty() {
                            return Err(TranslateError::InvalidConfiguration(
                                "json access log format requires at least one field".into(),
                            ));
                        }
                    }
                }
                AccessLogOutput::Streaming(sink) => {
                    if sink.log_name.is_empty() {
                        return Err(TranslateError::InvalidConfiguration(
                            "streaming access log requires a log name".into(),
                        ));
                    }
                }
            }
        }
        out.access_logs = als.access_log.clone();
        Ok(())
    }
}
