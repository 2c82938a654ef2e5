//! Shell scripts installed on a SLURM login node
//!
//! Scripts are written through an unquoted heredoc, so every `$` meant for
//! the script itself is escaped as `\$`.

use remex_core::domain::run::RemoteRunState;

use super::paths::ExecutorPaths;

/// Passed instead of a build output path when no build precedes the run
pub const NO_BUILD_CHECK: &str = "nocheck";

/// Last line the init script prints on success
pub const BUILD_COMPLETE_MARKER: &str = "build complete";

/// Write `contents` to `path` on the remote host
pub fn heredoc(path: &str, contents: &str) -> String {
    format!("cat > {} << HEREDOC_EOF\n{}\nHEREDOC_EOF", path, contents)
}

/// Commands creating an executable script
pub fn install_script(path: &str, contents: &str) -> [String; 2] {
    [heredoc(path, contents), format!("chmod u+x {}", path)]
}

/// Builds the task environment
///
/// Arguments: task directory, then the packages to install.
pub fn init_script(paths: &ExecutorPaths) -> String {
    format!(
        r#"#!/bin/bash
#SBATCH --output {output}
mkdir -p "\$1"
cd "\$1"
python3 -m venv ./.venv
. ./.venv/bin/activate
pip install "\${{@:2}}"
deactivate
echo "{marker}""#,
        output = paths.build_output_pattern(),
        marker = BUILD_COMPLETE_MARKER,
    )
}

/// Runs one job, or reports a failed build through the informant
///
/// Arguments: task directory, run input, build output (or `nocheck`),
/// informant script, fail event type, run id, job arguments.
pub fn run_script(paths: &ExecutorPaths) -> String {
    format!(
        r#"#!/bin/bash
#SBATCH --output {output}
if [[ "\$3" != "{nocheck}" && -f "\$3" ]]; then
    "\$4" "\$5" "\$6"
    exit
fi
cd "\$1"
. ./.venv/bin/activate
cat "\$2" | python3 {runner} ./job.py "\${{@:7}}"
echo "\$?""#,
        output = paths.run_output_pattern(),
        nocheck = NO_BUILD_CHECK,
        runner = paths.runner(),
    )
}

/// Runs after the build; a completed build loses its output file and gets
/// its cache record written, a failed one keeps the output as evidence
///
/// Arguments: build output, validity guard, cache record path.
pub fn clean_script() -> String {
    format!(
        r#"#!/bin/bash
grep -q "{marker}$" "\$1" && rm -f "\$1" && echo "\$2" > "\$3""#,
        marker = BUILD_COMPLETE_MARKER,
    )
}

/// Tells the orchestrator a run failed because its build failed
///
/// Arguments: fail event type, run id.
pub fn informant_script(paths: &ExecutorPaths, trusted_url_base: &str) -> String {
    let curl = format!(
        "curl --cert {} --key {} --cacert {} --header \"Content-Type: application/json\" --request POST",
        paths.runner_cert(),
        paths.runner_key(),
        paths.ca_cert(),
    );
    format!(
        r#"#!/bin/bash
#SBATCH --output /dev/null
{curl} --data '{{"type":"'"\$1"'","data":"remote build failed"}}' {base}/remote/emit
{curl} --data '{{"runId":'"\$2"',"status":{{"status":{fail},"finished_at":'"\$(date +%s%3N)"'}},"output":"","errors":"remote build failed"}}' {base}/remote/status"#,
        curl = curl,
        base = trusted_url_base,
        fail = u8::from(RemoteRunState::RunFail),
    )
}

/// Translate a `squeue -o "%t"` state code
pub fn squeue_state(code: &str) -> Option<RemoteRunState> {
    match code.trim() {
        "CD" | "CG" => Some(RemoteRunState::Success),
        "CA" | "F" | "PR" | "S" | "ST" | "OOM" | "TO" | "NF" => Some(RemoteRunState::RunFail),
        "PD" => Some(RemoteRunState::Queued),
        "R" => Some(RemoteRunState::Running),
        _ => None,
    }
}

/// Interpret the last line of a run output as the job's exit code
pub fn exit_code_state(last_line: &str) -> Option<RemoteRunState> {
    match last_line.trim().parse::<i64>() {
        Ok(0) => Some(RemoteRunState::Success),
        Ok(_) => Some(RemoteRunState::RunFail),
        Err(_) => None,
    }
}
