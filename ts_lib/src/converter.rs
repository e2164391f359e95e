//! Alignment to read pair conversion on a worker.

use crate::command::{CommandSpec, ContainerRun};
use crate::remote::{ExecMode, Worker};
use crate::resolver::FastqConverter;
use crate::scratch::CONTAINER_DATA;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use ts_types::ToolIdentity;

/// Name of the conversion container, which a reset also has to remove.
pub const CONVERTER_CONTAINER: &str = "bam2fastq";

/// Runs the converter image on a worker: put the alignment, convert, fetch the reads.
pub struct ContainerConverter<'a> {
    worker: &'a Worker<'a>,
    tool: &'a ToolIdentity,
}

impl<'a> ContainerConverter<'a> {
    pub fn new(worker: &'a Worker<'a>, tool: &'a ToolIdentity) -> ContainerConverter<'a> {
        ContainerConverter { worker, tool }
    }
}

impl FastqConverter for ContainerConverter<'_> {
    fn convert(&self, sample_id: &str, bam: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
        let scratch = &self.worker.scratch;
        let file_name = bam
            .file_name()
            .with_context(|| format!("{} has no file name", bam.display()))?
            .to_string_lossy();
        let remote_bam = scratch.input_path("bam", &file_name);
        let remote_out = scratch.outputs_dir(CONVERTER_CONTAINER);

        self.worker.execute(
            &CommandSpec::new("mkdir").args([
                "-p",
                scratch.input_dir("bam").as_str(),
                remote_out.as_str(),
            ]),
            ExecMode::Strict,
        )?;
        self.worker.put(bam, &remote_bam)?;

        let run = ContainerRun::new(CONVERTER_CONTAINER, self.tool.docker.pinned())
            .mount(scratch.root(), CONTAINER_DATA)
            .env("SAMPLE_ID", sample_id)
            .args([scratch.to_container(&remote_bam), scratch.to_container(&remote_out)])
            .into_command();
        let result = self.worker.execute(&run, ExecMode::WarnOnly)?;
        if !result.success() {
            bail!(
                "{CONVERTER_CONTAINER} exited with status {}: {}",
                result.status,
                result.last_line()
            );
        }
        self.worker.get(&format!("{remote_out}/*.fastq*"), dest_dir)
    }
}
