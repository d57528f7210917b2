// src/pipelines/catalog.rs: static pipeline topologies

use crate::config::defs::FileFormat;
use crate::utils::command::{adapter_for, ToolKind};

/// Job input role every catalog pipeline reads from.
pub const ALIGNMENT_INPUT: &str = "alignment";

/// Where a stage input comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Source {
    /// A role in the JobSpec's inputs.
    Job(&'static str),
    /// The output of an earlier stage.
    Stage(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct StageInput {
    pub slot: &'static str,
    pub source: Source,
}

#[derive(Debug)]
pub struct StageDescriptor {
    pub name: &'static str,
    pub tool: ToolKind,
    pub inputs: &'static [StageInput],
    /// Stages that must have succeeded or been skipped, without their output being consumed.
    pub after: &'static [&'static str],
    pub optional: bool,
    /// Optional stage that only runs when the job sets its `enabled` option.
    pub opt_in: bool,
    /// Still runs after an unrelated stage failed.
    pub independent: bool,
    pub final_output: bool,
    pub output_role: &'static str,
}

impl StageDescriptor {
    /// Names of all stages this one waits for.
    pub fn dependencies(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.inputs
            .iter()
            .filter_map(|i| match i.source {
                Source::Stage(name) => Some(name),
                Source::Job(_) => None,
            })
            .chain(self.after.iter().copied())
    }

    pub fn output_format(&self) -> FileFormat {
        adapter_for(self.tool).output_format()
    }
}

#[derive(Debug)]
pub struct PipelineDef {
    pub name: &'static str,
    pub stages: &'static [StageDescriptor],
}

impl PipelineDef {
    pub fn stage(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Registry tags of the tools this pipeline runs, first use first.
    pub fn tool_tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<&'static str> = Vec::new();
        for stage in self.stages {
            let tag = adapter_for(stage.tool).tool_tag();
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        tags
    }
}

const FROM_JOB: &[StageInput] = &[StageInput {
    slot: "alignment",
    source: Source::Job(ALIGNMENT_INPUT),
}];
const FROM_SORT: &[StageInput] = &[StageInput {
    slot: "alignment",
    source: Source::Stage("sort_bam"),
}];
const FROM_MARKDUP: &[StageInput] = &[StageInput {
    slot: "alignment",
    source: Source::Stage("mark_duplicates"),
}];

const fn stage(
    name: &'static str,
    tool: ToolKind,
    inputs: &'static [StageInput],
    output_role: &'static str,
) -> StageDescriptor {
    StageDescriptor {
        name,
        tool,
        inputs,
        after: &[],
        optional: false,
        opt_in: false,
        independent: false,
        final_output: true,
        output_role,
    }
}

const SORT_BAM: StageDescriptor =
    stage("sort_bam", ToolKind::SortBam, FROM_JOB, "sorted-alignment");

/// Validates the job input before a conversion; off unless enabled.
const VALIDATE_INPUT: StageDescriptor = StageDescriptor {
    optional: true,
    opt_in: true,
    final_output: false,
    ..stage("validate_input", ToolKind::ValidateSamFile, FROM_JOB, "validation-report")
};
const AFTER_VALIDATE_INPUT: &[&str] = &["validate_input"];

static PIPELINES: &[PipelineDef] = &[
    PipelineDef {
        name: "sam_to_bam",
        stages: &[
            VALIDATE_INPUT,
            StageDescriptor { after: AFTER_VALIDATE_INPUT, ..SORT_BAM },
        ],
    },
    PipelineDef {
        name: "bam_to_sam",
        stages: &[
            VALIDATE_INPUT,
            StageDescriptor {
                after: AFTER_VALIDATE_INPUT,
                ..stage("bam_to_sam", ToolKind::BamToSam, FROM_JOB, "sam-alignment")
            },
        ],
    },
    PipelineDef {
        name: "index_bam",
        stages: &[
            VALIDATE_INPUT,
            StageDescriptor {
                after: AFTER_VALIDATE_INPUT,
                ..stage("index_bam", ToolKind::IndexBam, FROM_JOB, "alignment-index")
            },
        ],
    },
    PipelineDef {
        name: "alignment_stats",
        stages: &[stage("flagstat", ToolKind::Flagstat, FROM_JOB, "alignment-stats")],
    },
    PipelineDef {
        name: "validate_alignment",
        stages: &[stage("validate", ToolKind::ValidateSamFile, FROM_JOB, "validation-report")],
    },
    PipelineDef {
        name: "mark_duplicates",
        stages: &[
            StageDescriptor { final_output: false, ..SORT_BAM },
            stage("mark_duplicates", ToolKind::MarkDuplicates, FROM_SORT, "marked-alignment"),
        ],
    },
    PipelineDef {
        name: "full",
        stages: &[
            StageDescriptor { final_output: false, ..SORT_BAM },
            StageDescriptor {
                optional: true,
                final_output: false,
                ..stage("validate_bam", ToolKind::ValidateSamFile, FROM_SORT, "validation-report")
            },
            StageDescriptor {
                after: &["validate_bam"],
                ..stage("mark_duplicates", ToolKind::MarkDuplicates, FROM_SORT, "marked-alignment")
            },
            stage("index_bam", ToolKind::IndexBam, FROM_MARKDUP, "alignment-index"),
            StageDescriptor {
                independent: true,
                ..stage("flagstat", ToolKind::Flagstat, FROM_MARKDUP, "alignment-stats")
            },
        ],
    },
];

pub fn pipeline(name: &str) -> Option<&'static PipelineDef> {
    PIPELINES.iter().find(|p| p.name == name)
}

pub fn pipeline_names() -> Vec<&'static str> {
    PIPELINES.iter().map(|p| p.name).collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_graph_is_ordered_and_type_correct() {
        for pipeline in PIPELINES {
            for (index, stage) in pipeline.stages.iter().enumerate() {
                let earlier = &pipeline.stages[..index];
                for dep in stage.dependencies() {
                    assert!(
                        earlier.iter().any(|s| s.name == dep),
                        "{}: {} depends on {} which does not precede it",
                        pipeline.name,
                        stage.name,
                        dep
                    );
                }
                let adapter = adapter_for(stage.tool);
                for input in stage.inputs {
                    let accepted = adapter
                        .inputs()
                        .iter()
                        .find(|r| r.slot == input.slot)
                        .map(|r| r.formats)
                        .unwrap_or(&[]);
                    if let Source::Stage(producer) = input.source {
                        let produced = pipeline.stage(producer).unwrap().output_format();
                        assert!(
                            accepted.contains(&produced),
                            "{}: {} cannot consume {} from {}",
                            pipeline.name,
                            stage.name,
                            produced,
                            producer
                        );
                    } else {
                        assert!(
                            !accepted.is_empty(),
                            "{}: unknown slot {}",
                            pipeline.name,
                            input.slot
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_full_pipeline_shape() {
        let full = pipeline("full").unwrap();
        let names: Vec<&str> = full.stages.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec!["sort_bam", "validate_bam", "mark_duplicates", "index_bam", "flagstat"]
        );
        assert!(full.stage("validate_bam").unwrap().optional);
        assert!(full.stage("flagstat").unwrap().independent);
        assert!(!full.stage("sort_bam").unwrap().final_output);
        assert_eq!(full.tool_tags(), vec!["samtools", "picard"]);
        assert!(pipeline("nope").is_none());
        assert_eq!(pipeline_names().len(), 7);
    }

    #[test]
    fn test_conversions_carry_opt_in_input_validation() {
        for name in ["sam_to_bam", "bam_to_sam", "index_bam"] {
            let pipeline = pipeline(name).unwrap();
            let gate = &pipeline.stages[0];
            assert_eq!(gate.name, "validate_input");
            assert!(gate.optional && gate.opt_in && !gate.final_output);
            assert_eq!(gate.inputs[0].source, Source::Job(ALIGNMENT_INPUT));
            assert_eq!(pipeline.stages[1].after, ["validate_input"]);
            assert!(pipeline.stages[1].final_output);
        }
        assert!(pipeline("full").unwrap().stages.iter().all(|s| !s.opt_in));
    }
}
