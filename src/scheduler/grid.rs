// The grid adapter: submit/resubmit/stop/communicate translated into `qsub`/`qstat`/`qdel`
// subprocess invocations against an SGE-style cluster.

use log::{debug, trace};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;

use crate::job::Job;
use crate::site::Site;
use crate::store::Store;
use crate::Error;

use super::{Backend, LiveStatus};

/// The grid execution backend, talking to the cluster through `qsub`/`qstat`/`qdel`.
pub struct GridBackend {
    database: PathBuf,
    site: Site,
}

impl GridBackend {
    pub fn new(database: PathBuf, site: Site) -> GridBackend {
        GridBackend { database, site }
    }

    fn qsub_args(&self, job: &Job, hold_for: &[String]) -> Vec<String> {
        let mut args = vec!["-terse".to_string()];

        if job.queue_name != crate::LOCAL_QUEUE_NAME {
            args.push("-q".to_string());
            args.push(job.queue_name.clone());
        }

        if let Some(log_dir) = &job.log_dir {
            args.push("-o".to_string());
            args.push(log_dir.display().to_string());
            args.push("-e".to_string());
            args.push(log_dir.display().to_string());
        }

        if let Some(array_spec) = job.array_spec {
            args.push("-t".to_string());
            args.push(format!(
                "{}-{}:{}",
                array_spec.first, array_spec.last, array_spec.step
            ));
        }

        if !hold_for.is_empty() {
            args.push("-hold_jid".to_string());
            args.push(hold_for.join(","));
        }

        for (key, value) in resource_args(&job.grid_arguments) {
            args.push("-l".to_string());
            args.push(format!("{key}={value}"));
        }

        args.extend(self.site.extra_qsub_args.iter().cloned());

        args.push("-V".to_string());
        args.push("-N".to_string());
        args.push(job.name.clone());
        args.push("jobctl".to_string());
        args.push("run-job".to_string());
        args.push("--database".to_string());
        args.push(self.database.display().to_string());

        args
    }

    /// The external ids of `job`'s own dependencies, for encoding as `-hold_jid`. A dependency
    /// routed through the local queue never gets a `qsub`-assigned id, so it is skipped --
    /// it already finished (by the time `job` reaches `Queued`, every dependency has) and SGE
    /// has nothing to hold against.
    ///
    /// # Errors
    /// Forwards store errors from opening a fresh connection against `self.database`.
    fn dependency_external_ids(&self, job: &Job) -> Result<Vec<String>, Error> {
        let store = Store::open(&self.database)?;
        let mut external_ids = Vec::new();
        for waited_id in store.dependencies_of(job.unique_id)? {
            let waited = store.get_job(waited_id)?;
            if waited.queue_name != crate::LOCAL_QUEUE_NAME && !waited.external_id.is_empty() {
                external_ids.push(waited.external_id);
            }
        }
        Ok(external_ids)
    }
}

/// Translate `grid_arguments` into `-l key=value` resource requests. Recognized keys are
/// passed through with their original name; unrecognized keys pass through verbatim so a
/// site can extend the set without an engine change.
fn resource_args(grid_arguments: &serde_json::Value) -> Vec<(String, String)> {
    let serde_json::Value::Object(map) = grid_arguments else {
        return Vec::new();
    };

    map.iter()
        .filter_map(|(key, value)| {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some((key.clone(), rendered))
        })
        .collect()
}

impl Backend for GridBackend {
    fn submit(&self, job: &Job) -> Result<String, Error> {
        let hold_for = self.dependency_external_ids(job)?;
        run_qsub(&self.qsub_args(job, &hold_for))
    }

    fn resubmit(&self, job: &Job) -> Result<String, Error> {
        let hold_for = self.dependency_external_ids(job)?;
        run_qsub(&self.qsub_args(job, &hold_for))
    }

    fn stop(&self, job: &Job) -> Result<(), Error> {
        let output = Command::new("qdel")
            .arg(&job.external_id)
            .output()
            .map_err(|e| Error::SpawnProcess("qdel".to_string(), e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if !stderr.contains("do not exist") {
                return Err(Error::ExternalTool("qdel".to_string(), stderr));
            }
        }

        Ok(())
    }

    fn communicate(&self, jobs: &[Job]) -> Result<Vec<LiveStatus>, Error> {
        let mut statuses = Vec::with_capacity(jobs.len());

        for job in jobs {
            let output = Command::new("qstat")
                .args(["-j", &job.external_id, "-f"])
                .output()
                .map_err(|e| Error::SpawnProcess("qstat".to_string(), e))?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let record = parse_qstat(&stdout);

            statuses.push(LiveStatus {
                external_id: job.external_id.clone(),
                task_index: None,
                queue_name: record.get("qname").cloned(),
                running: !record.is_empty(),
            });
        }

        Ok(statuses)
    }
}

fn run_qsub(args: &[String]) -> Result<String, Error> {
    trace!("Running: qsub {}", args.join(" "));
    let output = Command::new("qsub")
        .args(args)
        .output()
        .map_err(|e| Error::SpawnProcess("qsub".to_string(), e))?;

    if !output.status.success() {
        return Err(Error::ExternalTool(
            "qsub".to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let external_id = stdout.lines().next().unwrap_or("").trim().to_string();
    if external_id.is_empty() {
        return Err(Error::UnexpectedOutput(
            "qsub".to_string(),
            "no job id in -terse output".to_string(),
        ));
    }

    debug!("qsub assigned external id '{external_id}'.");
    Ok(external_id)
}

/// Parse `qstat -j <id> -f` output into a key -> value map.
///
/// Decorative `====`-style banner lines are discarded. Remaining lines are split on the
/// *first* `:`, both sides trimmed. A response containing the literal substring
/// `"do not exist"` anywhere is treated as "no such job" and yields an empty map. The queue
/// name, when present as `department:<queue>`, is reduced to the substring after the last
/// `:`.
pub fn parse_qstat(output: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();

    if output.contains("do not exist") {
        return result;
    }

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.chars().all(|c| c == '=') {
            continue;
        }

        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let key = key.trim().to_string();
        let mut value = value.trim().to_string();

        if key == "qname" || key == "hard_resource_list" {
            if let Some(idx) = value.rfind(':') {
                value = value[idx + 1..].to_string();
            }
        }

        result.insert(key, value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_pairs() {
        let output = "==============================================================\njob_number: 12345\nexec_file: job_scripts/12345\nqname: all.q\n";
        let parsed = parse_qstat(output);
        assert_eq!(parsed.get("job_number").unwrap(), "12345");
        assert_eq!(parsed.get("qname").unwrap(), "all.q");
    }

    #[test]
    fn detects_nonexistent_job() {
        let output = "Following jobs do not exist:\n12345\n";
        assert!(parse_qstat(output).is_empty());
    }

    #[test]
    fn reduces_department_prefixed_queue_name() {
        let output = "qname: department:all.q\n";
        let parsed = parse_qstat(output);
        assert_eq!(parsed.get("qname").unwrap(), "all.q");
    }

    #[test]
    fn discards_banner_lines() {
        let output = "====\njob_number: 1\n====\n";
        let parsed = parse_qstat(output);
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn resource_args_passes_through_unknown_keys() {
        let args = resource_args(&serde_json::json!({"mem_free": "4G", "custom_flag": true}));
        let map: HashMap<_, _> = args.into_iter().collect();
        assert_eq!(map.get("mem_free").unwrap(), "4G");
        assert_eq!(map.get("custom_flag").unwrap(), "true");
    }

    fn job_fixture() -> Job {
        Job {
            unique_id: 1,
            external_id: "1".to_string(),
            name: "true".to_string(),
            command: vec!["/bin/true".to_string()],
            exec_dir: None,
            log_dir: None,
            array_spec: None,
            queue_name: "all.q".to_string(),
            machine_name: None,
            grid_arguments: serde_json::json!({}),
            stop_on_failure: false,
            status: crate::job::Status::Queued,
            result: None,
            submit_time: 0,
            start_time: None,
            finish_time: None,
            tasks: Vec::new(),
        }
    }

    #[test]
    fn qsub_args_encodes_hold_jid_when_dependencies_present() {
        let backend = GridBackend::new(PathBuf::from("submitted.sql3"), Site::default());
        let job = job_fixture();
        let args = backend.qsub_args(&job, &["10".to_string(), "11".to_string()]);
        let hold_index = args.iter().position(|a| a == "-hold_jid").unwrap();
        assert_eq!(args[hold_index + 1], "10,11");
    }

    #[test]
    fn qsub_args_omits_hold_jid_when_no_dependencies() {
        let backend = GridBackend::new(PathBuf::from("submitted.sql3"), Site::default());
        let job = job_fixture();
        let args = backend.qsub_args(&job, &[]);
        assert!(!args.iter().any(|a| a == "-hold_jid"));
    }

    #[test]
    fn dependency_external_ids_skips_local_queue_dependencies() {
        use crate::store::NewJob;

        let dir = tempfile::tempdir().unwrap();
        let database = dir.path().join("submitted.sql3");
        let mut store = Store::open(&database).unwrap();

        store
            .with_session(|store| {
                store.add_job(NewJob {
                    command: vec!["/bin/true".to_string()],
                    name: None,
                    dependencies: Vec::new(),
                    array_spec: None,
                    exec_dir: None,
                    log_dir: None,
                    queue_name: crate::LOCAL_QUEUE_NAME.to_string(),
                    stop_on_failure: false,
                    grid_arguments: serde_json::json!({}),
                })?;
                store.add_job(NewJob {
                    command: vec!["/bin/true".to_string()],
                    name: None,
                    dependencies: Vec::new(),
                    array_spec: None,
                    exec_dir: None,
                    log_dir: None,
                    queue_name: "all.q".to_string(),
                    stop_on_failure: false,
                    grid_arguments: serde_json::json!({}),
                })?;
                store.conn().execute(
                    "UPDATE jobs SET external_id = '555' WHERE unique_id = 2",
                    [],
                )?;
                store.add_job(NewJob {
                    command: vec!["/bin/true".to_string()],
                    name: None,
                    dependencies: vec![1, 2],
                    array_spec: None,
                    exec_dir: None,
                    log_dir: None,
                    queue_name: "all.q".to_string(),
                    stop_on_failure: false,
                    grid_arguments: serde_json::json!({}),
                })?;
                Ok(())
            })
            .unwrap();

        let backend = GridBackend::new(database, Site::default());
        let job = store.get_job(3).unwrap();
        let hold_for = backend.dependency_external_ids(&job).unwrap();
        assert_eq!(hold_for, vec!["555".to_string()]);
    }
}
