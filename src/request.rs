//! Request ingestion: one JSON object on stdin describes the whole job.
//!
//! The tree produced by serde_json is walked with an explicit path so every
//! rejection names the offending value (`$.pipes[1].limit: ...`). Unknown
//! keys are hard errors at every level.

use crate::error::Error;
use serde_json::Value;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Regular,
    CopyFile,
    StdStreams,
}

/// One element of the output plan.
#[derive(Debug, Clone)]
pub struct PipeSpec {
    pub kind: SinkKind,
    pub dest: PathBuf,
    pub src: Option<PathBuf>,
    pub as_stdout: bool,
    pub as_stderr: bool,
    pub limit: u64,
}

impl PipeSpec {
    /// Label used in error messages when the sink has no named source.
    pub fn src_label(&self) -> String {
        match &self.src {
            Some(path) => path.display().to_string(),
            None if self.as_stdout => "@stdout".into(),
            None if self.as_stderr => "@stderr".into(),
            None => "@stdStreams".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mount {
    pub fstype: String,
    pub src: Option<String>,
    pub dest: String,
    pub options: String,
    pub ro: bool,
}

#[derive(Debug, Clone)]
pub struct StdStreams {
    pub dest: PathBuf,
    pub limit: u64,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub host_name: String,
    pub domain_name: String,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub chroot: PathBuf,
    pub mounts: Vec<Mount>,
    pub cgroup: Option<PathBuf>,
    pub cgroup_root: Option<PathBuf>,
    pub cgroup_config: Vec<(String, String)>,
    pub seccomp_policy: Option<String>,
    pub va_randomize: bool,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub work_dir: PathBuf,
    /// None means no deadline.
    pub time_limit: Option<Duration>,
    pub std_streams: Option<StdStreams>,
    pub pipes: Vec<PipeSpec>,
    pub copy_files: Vec<PipeSpec>,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            host_name: "sandals".into(),
            domain_name: "sandals".into(),
            uid: 0,
            gid: 0,
            chroot: "/".into(),
            mounts: Vec::new(),
            cgroup: None,
            cgroup_root: None,
            cgroup_config: Vec::new(),
            seccomp_policy: None,
            va_randomize: true,
            cmd: Vec::new(),
            env: Vec::new(),
            work_dir: "/".into(),
            time_limit: None,
            std_streams: None,
            pipes: Vec::new(),
            copy_files: Vec::new(),
        }
    }
}

fn bad(path: &str, message: &str) -> Error {
    Error::BadRequest(format!("{}: {}", path, message))
}

fn want_object<'v>(
    value: &'v Value,
    path: &str,
) -> Result<&'v serde_json::Map<String, Value>, Error> {
    value.as_object().ok_or_else(|| bad(path, "expected an object"))
}

fn want_array<'v>(value: &'v Value, path: &str) -> Result<&'v [Value], Error> {
    value
        .as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| bad(path, "expected an array"))
}

fn want_str<'v>(value: &'v Value, path: &str) -> Result<&'v str, Error> {
    value.as_str().ok_or_else(|| bad(path, "expected a string"))
}

fn want_bool(value: &Value, path: &str) -> Result<bool, Error> {
    value.as_bool().ok_or_else(|| bad(path, "expected a boolean"))
}

fn want_unsigned(value: &Value, path: &str) -> Result<f64, Error> {
    let num = value
        .as_f64()
        .ok_or_else(|| bad(path, "expected a number"))?;
    if !num.is_finite() || num < 0.0 {
        return Err(bad(path, "expected a non-negative number"));
    }
    Ok(num)
}

fn want_id(value: &Value, path: &str) -> Result<u32, Error> {
    let num = want_unsigned(value, path)?;
    if num > i32::max_value() as f64 {
        return Err(bad(path, "value too big"));
    }
    Ok(num as u32)
}

fn want_limit(value: &Value, path: &str) -> Result<u64, Error> {
    let num = want_unsigned(value, path)?;
    if num >= u64::max_value() as f64 {
        Ok(u64::max_value())
    } else {
        Ok(num as u64)
    }
}

fn want_abs_path(value: &Value, path: &str) -> Result<PathBuf, Error> {
    let s = want_str(value, path)?;
    if !s.starts_with('/') {
        return Err(bad(path, "expected an absolute path"));
    }
    Ok(PathBuf::from(s))
}

fn str_array(value: &Value, path: &str) -> Result<Vec<String>, Error> {
    let items = want_array(value, path)?;
    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        out.push(want_str(item, &format!("{}[{}]", path, index))?.to_string());
    }
    Ok(out)
}

fn parse_time_limit(value: &Value, path: &str) -> Result<Option<Duration>, Error> {
    let secs = want_unsigned(value, path)?;
    // A deadline beyond any plausible epoch is treated as "no deadline";
    // Duration::from_secs_f64 would panic on such values anyway.
    if secs >= i64::max_value() as f64 {
        return Ok(None);
    }
    Ok(Some(Duration::from_secs_f64(secs)))
}

fn parse_mount(value: &Value, path: &str) -> Result<Mount, Error> {
    let object = want_object(value, path)?;
    let mut fstype = None;
    let mut src = None;
    let mut dest = None;
    let mut options = String::new();
    let mut ro = false;
    for (key, item) in object {
        let item_path = format!("{}.{}", path, key);
        match key.as_str() {
            "type" => fstype = Some(want_str(item, &item_path)?.to_string()),
            "src" => src = Some(want_str(item, &item_path)?.to_string()),
            "dest" => dest = Some(want_str(item, &item_path)?.to_string()),
            "options" => options = want_str(item, &item_path)?.to_string(),
            "ro" => ro = want_bool(item, &item_path)?,
            _ => return Err(bad(&item_path, "unknown key")),
        }
    }
    let fstype = fstype.ok_or_else(|| bad(path, "'type' missing"))?;
    let dest = dest.ok_or_else(|| bad(path, "'dest' missing"))?;
    if fstype == "bind" && src.is_none() {
        return Err(bad(path, "'src' missing"));
    }
    // A '..' component would let the mount escape the chroot.
    if dest.split('/').any(|comp| comp == "..") {
        return Err(bad(
            &format!("{}.dest", path),
            "'..' components are not allowed",
        ));
    }
    Ok(Mount {
        fstype,
        src,
        dest,
        options,
        ro,
    })
}

fn parse_pipe(value: &Value, path: &str, kind: SinkKind) -> Result<PipeSpec, Error> {
    let object = want_object(value, path)?;
    let mut spec = PipeSpec {
        kind,
        dest: PathBuf::new(),
        src: None,
        as_stdout: false,
        as_stderr: false,
        limit: u64::max_value(),
    };
    let mut have_dest = false;
    for (key, item) in object {
        let item_path = format!("{}.{}", path, key);
        match key.as_str() {
            "dest" => {
                spec.dest = PathBuf::from(want_str(item, &item_path)?);
                have_dest = true;
            }
            "src" => spec.src = Some(PathBuf::from(want_str(item, &item_path)?)),
            "stdout" => spec.as_stdout = want_bool(item, &item_path)?,
            "stderr" => spec.as_stderr = want_bool(item, &item_path)?,
            "limit" => spec.limit = want_limit(item, &item_path)?,
            _ => return Err(bad(&item_path, "unknown key")),
        }
    }
    if !have_dest {
        return Err(bad(path, "'dest' missing"));
    }
    match kind {
        SinkKind::Regular => {
            if !spec.as_stdout && !spec.as_stderr && spec.src.is_none() {
                return Err(bad(path, "'stdout' or 'stderr' or 'src' is required"));
            }
        }
        SinkKind::CopyFile => {
            if spec.src.is_none() {
                return Err(bad(path, "'src' missing"));
            }
        }
        SinkKind::StdStreams => {}
    }
    Ok(spec)
}

fn parse_std_streams(value: &Value, path: &str) -> Result<StdStreams, Error> {
    let object = want_object(value, path)?;
    let mut dest = None;
    let mut limit = u64::max_value();
    for (key, item) in object {
        let item_path = format!("{}.{}", path, key);
        match key.as_str() {
            "dest" => dest = Some(PathBuf::from(want_str(item, &item_path)?)),
            "limit" => limit = want_limit(item, &item_path)?,
            _ => return Err(bad(&item_path, "unknown key")),
        }
    }
    let dest = dest.ok_or_else(|| bad(path, "'dest' missing"))?;
    Ok(StdStreams { dest, limit })
}

impl Request {
    /// Parses and validates the full request read from stdin.
    pub fn parse_slice(input: &[u8]) -> Result<Request, Error> {
        let value: Value = serde_json::from_slice(input)
            .map_err(|err| Error::BadRequest(err.to_string()))?;
        Request::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Request, Error> {
        let object = want_object(value, "$")?;
        let mut request = Request::default();
        for (key, item) in object {
            let path = format!("$.{}", key);
            match key.as_str() {
                "hostName" => request.host_name = want_str(item, &path)?.to_string(),
                "domainName" => request.domain_name = want_str(item, &path)?.to_string(),
                "uid" => request.uid = want_id(item, &path)?,
                "gid" => request.gid = want_id(item, &path)?,
                "chroot" => request.chroot = PathBuf::from(want_str(item, &path)?),
                "mounts" => {
                    for (index, mount) in want_array(item, &path)?.iter().enumerate() {
                        request
                            .mounts
                            .push(parse_mount(mount, &format!("{}[{}]", path, index))?);
                    }
                }
                "cgroup" => request.cgroup = Some(want_abs_path(item, &path)?),
                "cgroupRoot" => request.cgroup_root = Some(want_abs_path(item, &path)?),
                "cgroupConfig" => {
                    for (name, val) in want_object(item, &path)? {
                        let val_path = format!("{}.{}", path, name);
                        request
                            .cgroup_config
                            .push((name.clone(), want_str(val, &val_path)?.to_string()));
                    }
                }
                "seccompPolicy" => {
                    request.seccomp_policy = Some(want_str(item, &path)?.to_string())
                }
                "vaRandomize" => request.va_randomize = want_bool(item, &path)?,
                "cmd" => request.cmd = str_array(item, &path)?,
                "env" => request.env = str_array(item, &path)?,
                "workDir" => request.work_dir = PathBuf::from(want_str(item, &path)?),
                "timeLimit" => request.time_limit = parse_time_limit(item, &path)?,
                "stdStreams" => request.std_streams = Some(parse_std_streams(item, &path)?),
                "pipes" => {
                    for (index, pipe) in want_array(item, &path)?.iter().enumerate() {
                        request.pipes.push(parse_pipe(
                            pipe,
                            &format!("{}[{}]", path, index),
                            SinkKind::Regular,
                        )?);
                    }
                }
                "copyFiles" => {
                    for (index, pipe) in want_array(item, &path)?.iter().enumerate() {
                        request.copy_files.push(parse_pipe(
                            pipe,
                            &format!("{}[{}]", path, index),
                            SinkKind::CopyFile,
                        )?);
                    }
                }
                _ => return Err(bad(&path, "unknown key")),
            }
        }
        if request.cmd.is_empty() {
            return Err(Error::BadRequest("'cmd' missing or empty".into()));
        }
        if request.output_plan().len() > crate::ipc::MAX_SINKS {
            return Err(Error::BadRequest(format!(
                "too many output sinks (at most {})",
                crate::ipc::MAX_SINKS
            )));
        }
        Ok(request)
    }

    /// The ordered output plan: declared pipes, then copy-files, then the
    /// optional stdStreams sink. The spawner materializes fds in exactly
    /// this order and the supervisor unpacks them positionally.
    pub fn output_plan(&self) -> Vec<PipeSpec> {
        let mut plan = Vec::with_capacity(
            self.pipes.len() + self.copy_files.len() + self.std_streams.is_some() as usize,
        );
        plan.extend(self.pipes.iter().cloned());
        plan.extend(self.copy_files.iter().cloned());
        if let Some(streams) = &self.std_streams {
            plan.push(PipeSpec {
                kind: SinkKind::StdStreams,
                dest: streams.dest.clone(),
                src: None,
                as_stdout: false,
                as_stderr: false,
                limit: streams.limit,
            });
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Result<Request, Error> {
        Request::parse_slice(input.as_bytes())
    }

    fn parse_err(input: &str) -> String {
        match parse(input) {
            Err(Error::BadRequest(msg)) => msg,
            other => panic!("expected BadRequest, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn minimal_request() {
        let req = parse(r#"{"cmd":["/bin/true"]}"#).unwrap();
        assert_eq!(req.cmd, vec!["/bin/true"]);
        assert_eq!(req.chroot, PathBuf::from("/"));
        assert_eq!(req.host_name, "sandals");
        assert!(req.va_randomize);
        assert!(req.time_limit.is_none());
        assert!(req.output_plan().is_empty());
    }

    #[test]
    fn cmd_missing() {
        assert_eq!(parse_err("{}"), "'cmd' missing or empty");
    }

    #[test]
    fn cmd_empty() {
        assert_eq!(parse_err(r#"{"cmd":[]}"#), "'cmd' missing or empty");
    }

    #[test]
    fn unknown_top_level_key() {
        assert_eq!(
            parse_err(r#"{"cmd":["/bin/true"],"frobnicate":1}"#),
            "$.frobnicate: unknown key"
        );
    }

    #[test]
    fn trailing_garbage_rejected() {
        assert!(parse(r#"{"cmd":["/bin/true"]} extra"#).is_err());
    }

    #[test]
    fn not_an_object() {
        assert_eq!(parse_err("[1,2]"), "$: expected an object");
    }

    #[test]
    fn negative_uid_rejected() {
        assert_eq!(
            parse_err(r#"{"cmd":["/bin/true"],"uid":-1}"#),
            "$.uid: expected a non-negative number"
        );
    }

    #[test]
    fn huge_uid_rejected() {
        assert_eq!(
            parse_err(r#"{"cmd":["/bin/true"],"uid":4000000000}"#),
            "$.uid: value too big"
        );
    }

    #[test]
    fn negative_time_limit_rejected() {
        assert_eq!(
            parse_err(r#"{"cmd":["/bin/true"],"timeLimit":-0.5}"#),
            "$.timeLimit: expected a non-negative number"
        );
    }

    #[test]
    fn fractional_time_limit() {
        let req = parse(r#"{"cmd":["/bin/true"],"timeLimit":0.05}"#).unwrap();
        let limit = req.time_limit.unwrap();
        assert_eq!(limit.as_millis(), 50);
    }

    #[test]
    fn zero_time_limit_is_kept() {
        let req = parse(r#"{"cmd":["/bin/true"],"timeLimit":0}"#).unwrap();
        assert_eq!(req.time_limit, Some(Duration::from_secs(0)));
    }

    #[test]
    fn mount_requires_dest() {
        assert_eq!(
            parse_err(r#"{"cmd":["/bin/true"],"mounts":[{"type":"proc"}]}"#),
            "$.mounts[0]: 'dest' missing"
        );
    }

    #[test]
    fn bind_mount_requires_src() {
        assert_eq!(
            parse_err(r#"{"cmd":["/bin/true"],"mounts":[{"type":"bind","dest":"/x"}]}"#),
            "$.mounts[0]: 'src' missing"
        );
    }

    #[test]
    fn mount_dest_escaping_chroot_rejected() {
        assert_eq!(
            parse_err(
                r#"{"cmd":["/bin/true"],"mounts":[{"type":"proc","dest":"/a/../../etc"}]}"#
            ),
            "$.mounts[0].dest: '..' components are not allowed"
        );
    }

    #[test]
    fn mount_order_preserved() {
        let req = parse(
            r#"{"cmd":["/bin/true"],"mounts":[
                {"type":"proc","dest":"/proc"},
                {"type":"bind","src":"/usr","dest":"/usr","ro":true},
                {"type":"tmpfs","dest":"/tmp","options":"size=1m"}
            ]}"#,
        )
        .unwrap();
        let dests: Vec<_> = req.mounts.iter().map(|m| m.dest.as_str()).collect();
        assert_eq!(dests, vec!["/proc", "/usr", "/tmp"]);
        assert!(req.mounts[1].ro);
        assert_eq!(req.mounts[2].options, "size=1m");
    }

    #[test]
    fn pipe_requires_role_or_src() {
        assert_eq!(
            parse_err(r#"{"cmd":["/bin/true"],"pipes":[{"dest":"out"}]}"#),
            "$.pipes[0]: 'stdout' or 'stderr' or 'src' is required"
        );
    }

    #[test]
    fn pipe_unknown_key_is_qualified() {
        assert_eq!(
            parse_err(r#"{"cmd":["/bin/true"],"pipes":[{"dest":"out","bogus":1}]}"#),
            "$.pipes[0].bogus: unknown key"
        );
    }

    #[test]
    fn copy_file_requires_src() {
        assert_eq!(
            parse_err(r#"{"cmd":["/bin/true"],"copyFiles":[{"dest":"out"}]}"#),
            "$.copyFiles[0]: 'src' missing"
        );
    }

    #[test]
    fn std_streams_requires_dest() {
        assert_eq!(
            parse_err(r#"{"cmd":["/bin/true"],"stdStreams":{"limit":10}}"#),
            "$.stdStreams: 'dest' missing"
        );
    }

    #[test]
    fn output_plan_order() {
        let req = parse(
            r#"{"cmd":["/bin/true"],
                "pipes":[{"dest":"a","stdout":true},{"dest":"b","src":"/fifo"}],
                "copyFiles":[{"dest":"c","src":"/result"}],
                "stdStreams":{"dest":"d","limit":100}}"#,
        )
        .unwrap();
        let plan = req.output_plan();
        let kinds: Vec<_> = plan.iter().map(|p| p.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SinkKind::Regular,
                SinkKind::Regular,
                SinkKind::CopyFile,
                SinkKind::StdStreams
            ]
        );
        assert_eq!(plan[3].limit, 100);
        assert_eq!(plan[1].src_label(), "/fifo");
        assert_eq!(plan[0].src_label(), "@stdout");
    }

    #[test]
    fn cgroup_wins_over_cgroup_root() {
        let req = parse(
            r#"{"cmd":["/bin/true"],"cgroup":"/sys/fs/cgroup/x","cgroupRoot":"/sys/fs/cgroup/y"}"#,
        )
        .unwrap();
        assert_eq!(req.cgroup, Some(PathBuf::from("/sys/fs/cgroup/x")));
        assert_eq!(req.cgroup_root, Some(PathBuf::from("/sys/fs/cgroup/y")));
    }

    #[test]
    fn cgroup_must_be_absolute() {
        assert_eq!(
            parse_err(r#"{"cmd":["/bin/true"],"cgroup":"relative/path"}"#),
            "$.cgroup: expected an absolute path"
        );
    }

    #[test]
    fn cgroup_config_values_must_be_strings() {
        assert_eq!(
            parse_err(r#"{"cmd":["/bin/true"],"cgroupConfig":{"pids.max":32}}"#),
            "$.cgroupConfig.pids.max: expected a string"
        );
    }

    #[test]
    fn env_and_cmd_order_preserved() {
        let req = parse(
            r#"{"cmd":["/bin/sh","-c","exit 7"],"env":["B=2","A=1"]}"#,
        )
        .unwrap();
        assert_eq!(req.cmd, vec!["/bin/sh", "-c", "exit 7"]);
        assert_eq!(req.env, vec!["B=2", "A=1"]);
    }

    #[test]
    fn pipe_limit_truncates_fraction() {
        let req = parse(r#"{"cmd":["/bin/true"],"pipes":[{"dest":"o","stdout":true,"limit":10.9}]}"#)
            .unwrap();
        assert_eq!(req.pipes[0].limit, 10);
    }
}
