//! The ordered stage table and its validation.

use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;
use ts_types::{
    ArtifactSpec, ConfigError, DockerImage, Optionality, PipelineStage, Placement, ToolIdentity,
};

pub const CHECKSUM: &str = "checksum";
pub const EXPRESSION: &str = "expression";
pub const QC: &str = "qc";
pub const PIZZLY: &str = "pizzly";
pub const FUSION: &str = "fusion";
pub const JFKM: &str = "jfkm";
pub const VARIANTS: &str = "variants";

/// Artifact keys available before any stage has run: the resolved read pair.
pub const FASTQ_1: &str = "fastq_1";
pub const FASTQ_2: &str = "fastq_2";

const TREEHOUSE_PIPELINES: &str = "https://github.com/UCSC-Treehouse/pipelines";

/// A validated, totally ordered list of stages.
///
/// Construction guarantees that every stage input is either the resolved read pair or an
/// output of a strictly earlier stage, so the provenance graph of a sample is a DAG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<PipelineStage>,
}

impl Pipeline {
    pub fn new(stages: Vec<PipelineStage>) -> Result<Pipeline, ConfigError> {
        let mut names = HashSet::new();
        let mut dirs: HashMap<String, &str> = HashMap::new();
        let mut available: HashSet<&str> = [FASTQ_1, FASTQ_2].into_iter().collect();
        for stage in &stages {
            if !names.insert(stage.name.as_str()) {
                return Err(ConfigError::DuplicateStage {
                    stage: stage.name.clone(),
                });
            }
            let dir = stage.stage_dir_name();
            if let Some(first) = dirs.get(&dir) {
                return Err(ConfigError::DuplicateStageDir {
                    first: first.to_string(),
                    second: stage.name.clone(),
                    dir,
                });
            }
            dirs.insert(dir, &stage.name);
            if let Some(key) = stage.inputs.iter().find(|k| !available.contains(k.as_str())) {
                return Err(ConfigError::UnknownInput {
                    stage: stage.name.clone(),
                    key: key.clone(),
                });
            }
            for output in &stage.outputs {
                if !available.insert(&output.key) {
                    return Err(ConfigError::DuplicateOutput {
                        stage: stage.name.clone(),
                        key: output.key.clone(),
                    });
                }
            }
        }
        Ok(Pipeline { stages })
    }

    /// The Treehouse RNA-seq chain: checksum, expression, qc, three best-effort fusion/k-mer
    /// stages and variant calling on the quality controlled alignment.
    pub fn treehouse() -> Pipeline {
        Pipeline {
            stages: treehouse_stages(),
        }
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn get(&self, name: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Container names used by the stages, which are also what a reset has to remove.
    pub fn container_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown placeholder {{{name}}} in '{template}'")]
pub struct TemplateError {
    pub name: String,
    pub template: String,
}

/// Substitute `{name}` placeholders. Unknown names are an error rather than an empty string.
pub fn render_template(
    template: &str,
    values: &BTreeMap<String, String>,
) -> Result<String, TemplateError> {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder =
        PLACEHOLDER.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("valid regex"));

    let mut rendered = String::with_capacity(template.len());
    let mut last = 0;
    for cap in placeholder.captures_iter(template) {
        let (whole, name) = (&cap[0], &cap[1]);
        let value = values.get(name).ok_or_else(|| TemplateError {
            name: name.to_string(),
            template: template.to_string(),
        })?;
        let start = cap.get(0).map_or(last, |m| m.start());
        rendered.push_str(&template[last..start]);
        rendered.push_str(value);
        last = start + whole.len();
    }
    rendered.push_str(&template[last..]);
    Ok(rendered)
}

fn tool(source: &str, url: &str, version: &str, hash: &str) -> ToolIdentity {
    ToolIdentity {
        source: source.to_string(),
        docker: DockerImage {
            url: url.to_string(),
            version: version.to_string(),
            hash: format!("sha256:{hash}"),
        },
    }
}

fn output(key: &str, pattern: &str, canonical: Option<&str>) -> ArtifactSpec {
    ArtifactSpec {
        key: key.to_string(),
        pattern: pattern.to_string(),
        canonical: canonical.map(String::from),
        placement: Placement::Publish,
        optional: false,
    }
}

fn optional(spec: ArtifactSpec) -> ArtifactSpec {
    ArtifactSpec {
        optional: true,
        ..spec
    }
}

fn derived(spec: ArtifactSpec) -> ArtifactSpec {
    ArtifactSpec {
        placement: Placement::Derived,
        ..spec
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn stage(
    name: &str,
    optionality: Optionality,
    tool: ToolIdentity,
    inputs: &[&str],
    args: &[&str],
    outputs: Vec<ArtifactSpec>,
) -> PipelineStage {
    PipelineStage {
        name: name.to_string(),
        optionality,
        tool,
        inputs: strings(inputs),
        args: strings(args),
        env: BTreeMap::new(),
        outputs,
    }
}

fn treehouse_stages() -> Vec<PipelineStage> {
    use Optionality::{BestEffort, Required};
    vec![
        stage(
            CHECKSUM,
            Required,
            tool(
                TREEHOUSE_PIPELINES,
                "ucsctreehouse/md5sum",
                "1.0.0",
                "3f07e359639605c6bd2958358d0130e093b16abcf8ac1e772b4cd91f36cfae7f",
            ),
            &[FASTQ_1, FASTQ_2],
            &["--output", "{output_dir}/md5", "{fastq_1}", "{fastq_2}"],
            vec![output("md5", "md5", None)],
        ),
        stage(
            EXPRESSION,
            Required,
            tool(
                "https://github.com/BD2KGenomics/toil-rnaseq",
                "quay.io/ucsc_cgl/rnaseq-cgl-pipeline",
                "3.3.4-1.12.3",
                "785eee9f750ab91078d84d1ee779b6f74717eafc09e49da817af6b87619b0756",
            ),
            &[FASTQ_1, FASTQ_2],
            &[
                "--star",
                "{references_dir}/starIndex_hg38_no_alt.tar.gz",
                "--rsem",
                "{references_dir}/rsem_ref_hg38_no_alt.tar.gz",
                "--kallisto",
                "{references_dir}/kallisto_hg38.idx",
                "--hera",
                "{references_dir}/hera-index.tar.gz",
                "--save-bam",
                "--output-basenames",
                "--output-dir",
                "{output_dir}",
                "--samples",
                "{fastq_1}",
                "{fastq_2}",
            ],
            vec![
                output("expression", "{sample_id}.tar.gz", Some("expression.tar.gz")),
                derived(output(
                    "aligned_bam",
                    "{sample_id}.sortedByCoord.md.bam",
                    Some("sortedByCoord.md.bam"),
                )),
            ],
        ),
        stage(
            QC,
            Required,
            tool(
                "https://github.com/UCSC-Treehouse/bam-umend-qc",
                "ucsctreehouse/bam-umend-qc",
                "1.1.1",
                "8bfd877921b6e2f52bf42b4d7d9d3ed42673365f2d0b57f08692f50cad89c7e7",
            ),
            &["aligned_bam"],
            &["{aligned_bam}", "{output_dir}"],
            vec![
                derived(output(
                    "qc_bam",
                    "sortedByCoord.md.bam",
                    Some("qc.sortedByCoord.md.bam"),
                )),
                optional(derived(output(
                    "qc_bam_index",
                    "sortedByCoord.md.bam.bai",
                    Some("qc.sortedByCoord.md.bam.bai"),
                ))),
                output("qc_report", "bam_umend_qc.json", None),
                output("qc_table", "bam_umend_qc.tsv", None),
                optional(output("read_dist", "readDist.txt", None)),
            ],
        ),
        stage(
            PIZZLY,
            BestEffort,
            tool(
                "https://github.com/UCSC-Treehouse/pizzly",
                "ucsctreehouse/pizzly",
                "0.37.3",
                "16955af9f299facd8f6c558dfe0744c0595e5dbe490bb686c8bae833c8fd355d",
            ),
            &[FASTQ_1, FASTQ_2],
            &[
                "-p",
                "{sample_id}",
                "-r1",
                "{fastq_1}",
                "-r2",
                "{fastq_2}",
                "-o",
                "{output_dir}",
            ],
            vec![output(
                "pizzly_fusions",
                "{sample_id}-pizzly-fusion.final",
                Some("pizzly-fusion.final"),
            )],
        ),
        stage(
            FUSION,
            BestEffort,
            tool(
                "https://github.com/UCSC-Treehouse/fusion",
                "ucsctreehouse/fusion",
                "0.1.0",
                "9752e10c413813123ac3652ac40a65058b4a0a6b51d31323b141b5026cb5eee5",
            ),
            &[FASTQ_1, FASTQ_2],
            &[
                "--left-fq",
                "{fastq_1}",
                "--right-fq",
                "{fastq_2}",
                "--output-dir",
                "{output_dir}",
                "--genome-lib-dir",
                "{references_dir}/STARFusion-GRCh38gencode23",
                "--run-fusion-inspector",
            ],
            vec![
                output(
                    "star_fusions",
                    "star-fusion-non-filtered.final",
                    None,
                ),
                optional(output(
                    "star_fusions_filtered",
                    "star-fusion-gene-list-filtered.final",
                    None,
                )),
                optional(output(
                    "fusion_inspector",
                    "FusionInspector.fusion_predictions.final",
                    None,
                )),
            ],
        ),
        stage(
            JFKM,
            BestEffort,
            tool(
                "https://github.com/UCSC-Treehouse/jfkm",
                "ucsctreehouse/jfkm",
                "0.1.0",
                "04ce02f8c312649413016c71a9365edce20f150d2ae43368ccf87e2e0403d9b5",
            ),
            &[FASTQ_1, FASTQ_2],
            &["{fastq_1}", "{fastq_2}", "{output_dir}"],
            vec![output(
                "kmer_counts",
                "{sample_id}_jfkm.tsv.gz",
                Some("jfkm.tsv.gz"),
            )],
        ),
        stage(
            VARIANTS,
            Required,
            tool(
                "https://github.com/UCSC-Treehouse/mini-var-call",
                "ucsctreehouse/mini-var-call",
                "0.0.1",
                "4c7a56175140c3f30c33b70f37350e5cc6847fbc3be75fc6ca25d0cdd8ace301",
            ),
            &["qc_bam"],
            &[
                "{qc_bam}",
                "{references_dir}/GCA_000001405.15_GRCh38_no_alt_analysis_set.fa",
                "{output_dir}",
            ],
            vec![output("variants_vcf", "mini.ann.vcf", None)],
        ),
    ]
}

/// The container that turns an alignment back into a read pair.
pub fn default_converter() -> ToolIdentity {
    tool(
        TREEHOUSE_PIPELINES,
        "ucsctreehouse/bam2fastq",
        "0.1.0",
        "ef6615648e5159322686310f0088c367f4f4807183486626c2e3238a77ec5093",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_treehouse_is_valid() {
        let pipeline = Pipeline::new(treehouse_stages()).unwrap();
        assert_eq!(pipeline, Pipeline::treehouse());
        let names: Vec<_> = pipeline.stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            [CHECKSUM, EXPRESSION, QC, PIZZLY, FUSION, JFKM, VARIANTS]
        );
        let required: Vec<_> = pipeline
            .stages()
            .iter()
            .filter(|s| s.is_required())
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(required, [CHECKSUM, EXPRESSION, QC, VARIANTS]);
    }

    #[test]
    fn test_sequence_outputs_are_derived() {
        let pipeline = Pipeline::treehouse();
        let mut derived_names = Vec::new();
        for stage in pipeline.stages() {
            for spec in &stage.outputs {
                let name = spec.canonical.clone().unwrap_or_else(|| spec.pattern.clone());
                let sequence = [".bam", ".bai", ".fastq", ".fq"]
                    .iter()
                    .any(|ext| name.contains(ext));
                if sequence {
                    assert_eq!(spec.placement, Placement::Derived, "{}: {name}", stage.name);
                    derived_names.push(name);
                }
            }
        }
        // stages must not overwrite each other in the derived cache
        assert_eq!(
            derived_names,
            [
                "sortedByCoord.md.bam",
                "qc.sortedByCoord.md.bam",
                "qc.sortedByCoord.md.bam.bai"
            ]
        );
    }

    #[test]
    fn test_forward_reference_rejected() {
        let mut stages = treehouse_stages();
        // variants before qc consumes qc_bam before it exists
        let variants = stages.pop().unwrap();
        stages.insert(2, variants);
        let err = Pipeline::new(stages).unwrap_err();
        assert!(
            matches!(err, ConfigError::UnknownInput { ref stage, ref key } if stage == VARIANTS && key == "qc_bam"),
            "{err}"
        );
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut stages = treehouse_stages();
        stages.push(stages[0].clone());
        assert!(matches!(
            Pipeline::new(stages),
            Err(ConfigError::DuplicateStage { .. })
        ));

        let mut stages = treehouse_stages();
        let mut again = stages[1].clone();
        again.name = "expression2".to_string();
        stages.push(again);
        assert!(matches!(
            Pipeline::new(stages),
            Err(ConfigError::DuplicateStageDir { .. })
        ));

        let mut stages = treehouse_stages();
        stages[3].outputs[0].key = "qc_bam".to_string();
        assert!(matches!(
            Pipeline::new(stages),
            Err(ConfigError::DuplicateOutput { .. })
        ));
    }

    #[test]
    fn test_render_template() {
        let values: BTreeMap<String, String> = [
            ("output_dir", "/data/outputs/qc"),
            ("sample_id", "TH01"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(
            render_template("{output_dir}/{sample_id}.md5", &values).unwrap(),
            "/data/outputs/qc/TH01.md5"
        );
        assert_eq!(render_template("--save-bam", &values).unwrap(), "--save-bam");
        assert_eq!(
            render_template("{fastq_1}", &values).unwrap_err().to_string(),
            "unknown placeholder {fastq_1} in '{fastq_1}'"
        );
    }
}
