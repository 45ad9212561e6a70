//! Argument construction for the external tools.

use std::path::Path;

use crate::{
    error::{Result, ScanError},
    models::ToolSettings,
    runner::Invocation,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ScanRequest {
    pub target: String,
    /// Restricts the run to one template and drops the severity and tag
    /// filters. Used by finding rescans.
    #[serde(default)]
    pub template_id: Option<String>,
}

impl ScanRequest {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            template_id: None,
        }
    }

    pub fn targeted(target: impl Into<String>, template_id: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            template_id: Some(template_id.into()),
        }
    }
}

pub trait ToolCommand: Send + Sync {
    fn name(&self) -> &'static str;
    fn invocation(&self, req: &ScanRequest, output: &Path) -> Result<Invocation>;
}

/// Template scanner command built from the persisted tool settings.
#[derive(Debug, Clone)]
pub struct NucleiCommand {
    pub binary: String,
    pub settings: ToolSettings,
}

impl ToolCommand for NucleiCommand {
    fn name(&self) -> &'static str {
        "nuclei"
    }

    fn invocation(&self, req: &ScanRequest, output: &Path) -> Result<Invocation> {
        let mut args = vec!["-target".to_string(), req.target.clone()];

        if let Some(template) = &req.template_id {
            if template.trim().is_empty() || template.starts_with('-') {
                return Err(ScanError::Validation(format!("invalid template id: {template:?}")));
            }
            args.push("-template-id".into());
            args.push(template.clone());
        } else {
            let s = &self.settings;
            if !s.severity_filter.is_empty() {
                args.push("-severity".into());
                args.push(s.severity_filter.join(","));
            }
            if !s.template_selectors.is_empty() {
                args.push("-template-id".into());
                args.push(s.template_selectors.join(","));
            } else if !s.scan_mode.tags().is_empty() {
                args.push("-tags".into());
                args.push(s.scan_mode.tags().join(","));
            }
            for (flag, value) in [
                ("-rate-limit", s.rate_limit),
                ("-concurrency", s.concurrency),
                ("-bulk-size", s.bulk_size),
            ] {
                if let Some(v) = value {
                    args.push(flag.into());
                    args.push(v.to_string());
                }
            }
            if let Some(custom) = &s.custom_args {
                args.extend(split_custom_args(custom)?);
            }
        }

        args.extend([
            "-jsonl".to_string(),
            "-output".to_string(),
            output.display().to_string(),
            "-silent".to_string(),
        ]);
        Ok(Invocation::new(&self.binary, args))
    }
}

/// Liveness probe run after a primary scan.
#[derive(Debug, Clone)]
pub struct HttpxCommand {
    pub binary: String,
}

impl ToolCommand for HttpxCommand {
    fn name(&self) -> &'static str {
        "httpx"
    }

    fn invocation(&self, req: &ScanRequest, output: &Path) -> Result<Invocation> {
        Ok(Invocation::new(
            &self.binary,
            vec![
                "-u".into(),
                req.target.clone(),
                "-json".into(),
                "-output".into(),
                output.display().to_string(),
                "-silent".into(),
            ],
        ))
    }
}

// Target and output flags are owned by the executor.
const RESERVED_FLAGS: [&str; 12] = [
    "o",
    "output",
    "je",
    "json-export",
    "jle",
    "jsonl-export",
    "target",
    "u",
    "l",
    "list",
    "me",
    "markdown-export",
];

/// Flag name of an argument, without dashes or an `=value` suffix.
fn flag_name(arg: &str) -> Option<String> {
    let name = arg.strip_prefix('-')?.trim_start_matches('-');
    let name = name.split_once('=').map_or(name, |(n, _)| n);
    Some(name.to_ascii_lowercase())
}

fn split_custom_args(raw: &str) -> Result<Vec<String>> {
    let args: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    if let Some(arg) = args
        .iter()
        .find(|a| flag_name(a).is_some_and(|name| RESERVED_FLAGS.contains(&name.as_str())))
    {
        return Err(ScanError::Validation(format!("custom args may not set {arg}")));
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanMode;

    fn nuclei(settings: ToolSettings) -> NucleiCommand {
        NucleiCommand {
            binary: "nuclei".into(),
            settings,
        }
    }

    #[test]
    fn default_settings_build_the_standard_command() {
        let inv = nuclei(ToolSettings::default())
            .invocation(&ScanRequest::new("example.com"), Path::new("/tmp/j.json"))
            .unwrap();
        assert_eq!(
            inv.command_line(),
            "nuclei -target example.com -severity critical,high,medium -tags cve,exposure -rate-limit 150 -concurrency 25 -jsonl -output /tmp/j.json -silent"
        );
    }

    #[test]
    fn template_selectors_replace_tags() {
        let settings = ToolSettings {
            scan_mode: ScanMode::Quick,
            template_selectors: vec!["CVE-2024-1".into(), "CVE-2024-2".into()],
            severity_filter: vec![],
            rate_limit: None,
            concurrency: None,
            bulk_size: Some(10),
            custom_args: Some("-timeout 5".into()),
            ..ToolSettings::default()
        };
        let inv = nuclei(settings)
            .invocation(&ScanRequest::new("a.test"), Path::new("out.json"))
            .unwrap();
        assert_eq!(
            inv.args,
            [
                "-target", "a.test", "-template-id", "CVE-2024-1,CVE-2024-2", "-bulk-size", "10",
                "-timeout", "5", "-jsonl", "-output", "out.json", "-silent"
            ]
        );
    }

    #[test]
    fn targeted_rescan_skips_filters() {
        let inv = nuclei(ToolSettings::default())
            .invocation(&ScanRequest::targeted("a.test", "CVE-2021-44228"), Path::new("r.json"))
            .unwrap();
        assert_eq!(
            inv.args,
            ["-target", "a.test", "-template-id", "CVE-2021-44228", "-jsonl", "-output", "r.json", "-silent"]
        );
    }

    #[test]
    fn full_mode_has_no_tag_filter() {
        let settings = ToolSettings {
            scan_mode: ScanMode::Full,
            ..ToolSettings::default()
        };
        let inv = nuclei(settings)
            .invocation(&ScanRequest::new("a.test"), Path::new("o.json"))
            .unwrap();
        assert!(!inv.args.iter().any(|a| a == "-tags"));
    }

    #[test]
    fn custom_args_cannot_redirect_output_or_target() {
        for custom in [
            "-o /etc/passwd",
            "-o=/etc/passwd",
            "--output /tmp/x",
            "-json-export /tmp/x",
            "-JSONL-EXPORT=/tmp/x",
            "-target=evil.test",
            "-timeout 5 -l hosts.txt",
        ] {
            let settings = ToolSettings {
                custom_args: Some(custom.into()),
                ..ToolSettings::default()
            };
            assert!(
                matches!(
                    nuclei(settings).invocation(&ScanRequest::new("a.test"), Path::new("o.json")),
                    Err(ScanError::Validation(_))
                ),
                "{custom} was accepted"
            );
        }
    }

    #[test]
    fn unreserved_flags_with_values_pass() {
        assert_eq!(
            split_custom_args("-timeout=5 --retries 2 -output-dir-like").unwrap(),
            ["-timeout=5", "--retries", "2", "-output-dir-like"]
        );
        assert_eq!(flag_name("--Output=/x").as_deref(), Some("output"));
        assert_eq!(flag_name("value"), None);
    }

    #[test]
    fn probe_command_shape() {
        let inv = HttpxCommand { binary: "httpx".into() }
            .invocation(&ScanRequest::new("a.test"), Path::new("p.json"))
            .unwrap();
        assert_eq!(inv.command_line(), "httpx -u a.test -json -output p.json -silent");
    }
}
