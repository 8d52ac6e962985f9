// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! PET preprocessing preset
//!
//! Builds the per-subject, per-session PET workflow:
//!
//! ```text
//! pet ──► motion_correction ──► time_weighted_average ──► coregistration ──┐
//!               │                  json ──┘                    ▲           │
//!               │                                      anat ───┤           │
//! ids ──► map_subjects ──► reconall ──► gtmseg ────────────────┼──┐        │
//!                 anat ──┘      └──────────────────────────────┘  ▼        ▼
//!               └────────────────────────────────────► partial_volume_correction
//!                                                                 │
//!                                                 (optional) kinetic_modelling
//! ```
//!
//! Every node kind has its own typed configuration, checked when the
//! configuration is loaded. The external tools are FSL `mcflirt` and
//! FreeSurfer/PETSurfer `recon-all`, `gtmseg`, `mri_coreg`, `mri_gtmpvc`
//! and `mri_glmfit`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::{FlowError, FlowResult};
use crate::pipeline::{Graph, Node, OutputBinding, PortKind, PortRef};

/// Prefix of every collected output inside the instance container
const PREPROC: &str = "preproc";

/// BIDS name stem of collected files
const BIDS_STEM: &str = "sub-{subject_id}_ses-{session_id}";

/// Typed configuration of the PET preset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PetConfig {
    #[serde(default)]
    pub templates: DatasetTemplates,

    #[serde(default)]
    pub motion_correction: MotionCorrectionConfig,

    pub time_weighted_average: TimeWeightedAverageConfig,

    #[serde(default)]
    pub reconall: ReconAllConfig,

    pub gtmseg: GtmSegConfig,

    #[serde(default)]
    pub coregistration: CoregistrationConfig,

    pub partial_volume_correction: PartialVolumeCorrectionConfig,

    /// MRTM kinetic modelling; skipped when absent
    #[serde(default)]
    pub kinetic_modelling: Option<KineticModellingConfig>,
}

/// Dataset templates relative to the data directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetTemplates {
    pub anat: String,
    pub pet: String,
    pub json: String,
}

impl Default for DatasetTemplates {
    fn default() -> Self {
        Self {
            anat: "sub-{subject_id}/ses-{session_id}/anat/*_T1w.nii".into(),
            pet: "sub-{subject_id}/ses-{session_id}/pet/*_pet.nii.gz".into(),
            json: "sub-{subject_id}/ses-{session_id}/pet/*_pet.json".into(),
        }
    }
}

/// MCFLIRT cost functions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostFunction {
    Mutualinfo,
    Woods,
    Corratio,
    #[default]
    Normcorr,
    Normmi,
    Leastsquares,
}

impl std::fmt::Display for CostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Mutualinfo => "mutualinfo",
            Self::Woods => "woods",
            Self::Corratio => "corratio",
            Self::Normcorr => "normcorr",
            Self::Normmi => "normmi",
            Self::Leastsquares => "leastsquares",
        };
        write!(f, "{}", name)
    }
}

/// Motion correction with FSL MCFLIRT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MotionCorrectionConfig {
    /// Register to the mean volume
    #[serde(default = "default_true")]
    pub mean_vol: bool,

    #[serde(default)]
    pub cost: CostFunction,

    #[serde(default = "default_mcflirt_dof")]
    pub dof: u8,

    /// Reference volume index; MCFLIRT uses the middle volume when unset
    #[serde(default)]
    pub ref_vol: Option<u32>,

    /// Also produce the motion parameter file
    #[serde(default)]
    pub save_plots: bool,
}

impl Default for MotionCorrectionConfig {
    fn default() -> Self {
        Self {
            mean_vol: true,
            cost: CostFunction::default(),
            dof: default_mcflirt_dof(),
            ref_vol: None,
            save_plots: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_mcflirt_dof() -> u8 {
    6
}

/// Time-weighted average over PET frames
///
/// `command` is a template over `{in_file}` (motion-corrected series),
/// `{json_file}` (BIDS sidecar with `FrameDuration`) and `{out_file}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeWeightedAverageConfig {
    pub command: String,
}

/// recon-all directives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Directive {
    #[default]
    #[serde(rename = "all")]
    All,
    #[serde(rename = "autorecon1")]
    Autorecon1,
    #[serde(rename = "autorecon2")]
    Autorecon2,
    #[serde(rename = "autorecon2-volonly")]
    Autorecon2Volonly,
    #[serde(rename = "autorecon3")]
    Autorecon3,
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::All => "all",
            Self::Autorecon1 => "autorecon1",
            Self::Autorecon2 => "autorecon2",
            Self::Autorecon2Volonly => "autorecon2-volonly",
            Self::Autorecon3 => "autorecon3",
        };
        write!(f, "{}", name)
    }
}

/// FreeSurfer recon-all
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconAllConfig {
    #[serde(default)]
    pub directive: Directive,

    /// FreeSurfer subjects directory; `{experiment_dir}/freesurfer` when unset
    #[serde(default)]
    pub subjects_dir: Option<PathBuf>,

    /// OpenMP threads
    #[serde(default)]
    pub openmp: Option<u32>,
}

/// Name of the gtmseg output feeding partial volume correction
///
/// Deployments disagree on this port name, so it must be chosen
/// explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GtmSegOutput {
    OutFile,
    GtmFile,
}

impl GtmSegOutput {
    pub fn port(self) -> &'static str {
        match self {
            Self::OutFile => "out_file",
            Self::GtmFile => "gtm_file",
        }
    }
}

/// PETSurfer gtmseg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GtmSegConfig {
    /// Segment cerebellum white and grey matter
    #[serde(default)]
    pub xcerseg: bool,

    pub output_port: GtmSegOutput,
}

/// FreeSurfer mri_coreg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoregistrationConfig {
    #[serde(default = "default_coreg_dof")]
    pub dof: u8,
}

impl Default for CoregistrationConfig {
    fn default() -> Self {
        Self {
            dof: default_coreg_dof(),
        }
    }
}

fn default_coreg_dof() -> u8 {
    6
}

/// Auto-mask parameters of mri_gtmpvc
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoMask {
    pub fwhm: f64,
    pub threshold: f64,
}

/// PETSurfer mri_gtmpvc
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartialVolumeCorrectionConfig {
    /// Point spread function FWHM in mm
    pub psf: f64,

    #[serde(default)]
    pub default_seg_merge: bool,

    #[serde(default)]
    pub auto_mask: Option<AutoMask>,

    /// Reference region segmentation ids
    #[serde(default)]
    pub km_ref: Vec<u32>,

    /// High-binding region segmentation ids
    #[serde(default)]
    pub km_hb: Vec<u32>,

    #[serde(default)]
    pub no_rescale: bool,
}

/// MRTM kinetic modelling with mri_glmfit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KineticModellingConfig {
    /// Frame timing file
    pub time_file: PathBuf,
}

impl PetConfig {
    /// Check values the types alone cannot rule out
    pub fn validate(&self) -> FlowResult<()> {
        if ![6, 7, 9, 12].contains(&self.motion_correction.dof) {
            return Err(invalid(
                "motion_correction.dof",
                format!("{} is not one of 6, 7, 9, 12", self.motion_correction.dof),
            ));
        }

        if ![6, 9, 12].contains(&self.coregistration.dof) {
            return Err(invalid(
                "coregistration.dof",
                format!("{} is not one of 6, 9, 12", self.coregistration.dof),
            ));
        }

        if self.time_weighted_average.command.trim().is_empty() {
            return Err(invalid("time_weighted_average.command", "command is empty".into()));
        }

        let pvc = &self.partial_volume_correction;
        if !(pvc.psf.is_finite() && pvc.psf >= 0.0) {
            return Err(invalid(
                "partial_volume_correction.psf",
                format!("{} is not a non-negative number", pvc.psf),
            ));
        }

        if let Some(mask) = pvc.auto_mask {
            if mask.fwhm <= 0.0 || !(0.0..=1.0).contains(&mask.threshold) {
                return Err(invalid(
                    "partial_volume_correction.auto_mask",
                    "fwhm must be positive and threshold within 0..1".into(),
                ));
            }
        }

        if self.kinetic_modelling.is_some() && (pvc.km_ref.is_empty() || pvc.km_hb.is_empty()) {
            return Err(FlowError::InvalidConfig {
                reason: "kinetic_modelling needs reference and high-binding regions".into(),
                help: Some(
                    "Set partial_volume_correction.km_ref and km_hb (e.g. [8, 47] and [11, 12, 50, 51])"
                        .into(),
                ),
            });
        }

        for (name, template) in [
            ("anat", &self.templates.anat),
            ("pet", &self.templates.pet),
            ("json", &self.templates.json),
        ] {
            if template.trim().is_empty() {
                return Err(invalid(&format!("templates.{}", name), "template is empty".into()));
            }
        }

        Ok(())
    }

    /// FreeSurfer subjects directory for an experiment
    pub fn subjects_dir(&self, experiment_dir: &Path) -> PathBuf {
        match &self.reconall.subjects_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => experiment_dir.join(dir),
            None => experiment_dir.join("freesurfer"),
        }
    }

    /// Build the workflow graph
    ///
    /// `subjects_dir` must be an absolute path; the caller creates it
    /// before the workflow runs. Relative kinetic modelling time files
    /// are resolved against `experiment_dir`.
    pub fn build_graph(&self, subjects_dir: &Path, experiment_dir: &Path) -> FlowResult<Graph> {
        self.validate()?;

        let subjects_dir = subjects_dir.to_string_lossy().to_string();
        let gtm_port = self.gtmseg.output_port.port();

        let mut graph = Graph::new("pet_preprocessing");
        graph.description = Some("PET motion correction, registration and partial volume correction".into());

        graph.add_node(self.motion_correction_node())?;
        graph.add_node(self.time_weighted_average_node())?;
        graph.add_node(
            Node::function("map_subjects", "join")
                .describe("FreeSurfer subject name from session and subject ids")
                .input("session_id", PortKind::Scalar)
                .input("subject_id", PortKind::Scalar)
                .output("subject_id", PortKind::Scalar, "")
                .option("separator", "_"),
        )?;
        graph.add_node(self.reconall_node(&subjects_dir))?;
        graph.add_node(self.gtmseg_node(&subjects_dir))?;
        graph.add_node(self.coregistration_node(&subjects_dir))?;
        graph.add_node(self.partial_volume_correction_node(&subjects_dir))?;

        if let Some(km) = &self.kinetic_modelling {
            let time_file = if km.time_file.is_absolute() {
                km.time_file.clone()
            } else {
                experiment_dir.join(&km.time_file)
            };
            graph.add_node(
                Node::command(
                    "kinetic_modelling",
                    "mri_glmfit --y {in_file} --mrtm1 {ref_file} {time_file} --o {glm_dir} --no-est-fwhm --nii.gz --yhat-save",
                )
                .describe("MRTM kinetic modelling")
                .input("in_file", PortKind::FilePath)
                .input("ref_file", PortKind::FilePath)
                .output("glm_dir", PortKind::FilePath, "mrtm1")
                .option("time_file", time_file.to_string_lossy().to_string()),
            )?;
        }

        let t = &self.templates;
        graph.bind("motion_correction", "in_file", &t.pet)?;
        graph.bind("time_weighted_average", "json_file", &t.json)?;
        graph.bind("map_subjects", "session_id", "{session_id}")?;
        graph.bind("map_subjects", "subject_id", "{subject_id}")?;
        graph.bind("reconall", "T1_files", &t.anat)?;
        graph.bind("coregistration", "reference_file", &t.anat)?;

        graph.connect("motion_correction", "out_file", "time_weighted_average", "in_file")?;
        graph.connect("map_subjects", "subject_id", "reconall", "subject_id")?;
        graph.connect("reconall", "subject_id", "gtmseg", "subject_id")?;
        graph.connect("reconall", "subject_id", "coregistration", "subject_id")?;
        graph.connect("time_weighted_average", "out_file", "coregistration", "source_file")?;
        graph.connect("motion_correction", "out_file", "partial_volume_correction", "in_file")?;
        graph.connect("gtmseg", gtm_port, "partial_volume_correction", "segmentation")?;
        graph.connect("coregistration", "out_lta_file", "partial_volume_correction", "reg_file")?;

        if self.kinetic_modelling.is_some() {
            graph.connect("partial_volume_correction", "hb_file", "kinetic_modelling", "in_file")?;
            graph.connect("partial_volume_correction", "ref_file", "kinetic_modelling", "ref_file")?;
        }

        self.add_outputs(&mut graph, gtm_port);
        Ok(graph)
    }

    fn motion_correction_node(&self) -> Node {
        let mc = &self.motion_correction;
        let mut command = String::from("mcflirt -in {in_file} -out {out_file} -cost {cost} -dof {dof}");
        if mc.mean_vol {
            command.push_str(" -meanvol");
        }
        if mc.ref_vol.is_some() {
            command.push_str(" -refvol {ref_vol}");
        }
        if mc.save_plots {
            command.push_str(" -plots");
        }

        let mut node = Node::command("motion_correction", command)
            .describe("Motion correction (FSL MCFLIRT)")
            .input("in_file", PortKind::FilePath)
            .output("out_file", PortKind::FilePath, "{in_file.stem}_mcf.nii.gz")
            .option("cost", mc.cost.to_string())
            .option("dof", i64::from(mc.dof))
            .option("mean_vol", mc.mean_vol);

        if let Some(ref_vol) = mc.ref_vol {
            node = node.option("ref_vol", i64::from(ref_vol));
        }
        if mc.save_plots {
            node = node.output("par_file", PortKind::FilePath, "{in_file.stem}_mcf.nii.gz.par");
        }
        node
    }

    fn time_weighted_average_node(&self) -> Node {
        Node::command("time_weighted_average", self.time_weighted_average.command.clone())
            .describe("Time-weighted average over frames, weighted by FrameDuration")
            .input("in_file", PortKind::FilePath)
            .input("json_file", PortKind::FilePath)
            .output("out_file", PortKind::FilePath, "{in_file.stem}_twa.nii.gz")
    }

    fn reconall_node(&self, subjects_dir: &str) -> Node {
        let ra = &self.reconall;
        let mut command = format!(
            "recon-all -{} -subjid {{subject_id}} -i {{T1_files}} -sd {{subjects_dir}}",
            ra.directive
        );
        if ra.openmp.is_some() {
            command.push_str(" -openmp {openmp}");
        }

        let mut node = Node::command("reconall", command)
            .describe("Cortical reconstruction (FreeSurfer recon-all)")
            .input("T1_files", PortKind::FilePath)
            .input("subject_id", PortKind::Scalar)
            .output("subject_id", PortKind::Scalar, "{subject_id}")
            .option("directive", ra.directive.to_string())
            .option("subjects_dir", subjects_dir)
            .env("SUBJECTS_DIR", subjects_dir);

        if let Some(threads) = ra.openmp {
            node = node.option("openmp", i64::from(threads));
        }
        node
    }

    fn gtmseg_node(&self, subjects_dir: &str) -> Node {
        let mut command = String::from("gtmseg --s {subject_id}");
        if self.gtmseg.xcerseg {
            command.push_str(" --xcerseg");
        }

        Node::command("gtmseg", command)
            .describe("High-resolution segmentation (PETSurfer gtmseg)")
            .input("subject_id", PortKind::Scalar)
            .output(
                self.gtmseg.output_port.port(),
                PortKind::FilePath,
                "{subjects_dir}/{subject_id}/mri/gtmseg.mgz",
            )
            .option("subjects_dir", subjects_dir)
            .option("xcerseg", self.gtmseg.xcerseg)
            .env("SUBJECTS_DIR", subjects_dir)
    }

    fn coregistration_node(&self, subjects_dir: &str) -> Node {
        Node::command(
            "coregistration",
            "mri_coreg --s {subject_id} --mov {source_file} --ref {reference_file} --reg {out_lta_file} --dof {dof} --sd {subjects_dir}",
        )
        .describe("PET to anatomical registration (FreeSurfer mri_coreg)")
        .input("subject_id", PortKind::Scalar)
        .input("source_file", PortKind::FilePath)
        .input("reference_file", PortKind::FilePath)
        .output("out_lta_file", PortKind::FilePath, "{source_file.stem}_coreg.lta")
        .option("dof", i64::from(self.coregistration.dof))
        .option("subjects_dir", subjects_dir)
        .env("SUBJECTS_DIR", subjects_dir)
    }

    fn partial_volume_correction_node(&self, subjects_dir: &str) -> Node {
        let pvc = &self.partial_volume_correction;
        let mut command = String::from(
            "mri_gtmpvc --i {in_file} --seg {segmentation} --reg {reg_file} --psf {psf} --o {pvc_dir}",
        );

        if pvc.default_seg_merge {
            command.push_str(" --default-seg-merge");
        }
        if let Some(mask) = pvc.auto_mask {
            command.push_str(&format!(" --auto-mask {} {}", mask.fwhm, mask.threshold));
        }
        if !pvc.km_ref.is_empty() {
            command.push_str(&format!(" --km-ref {}", join_ids(&pvc.km_ref)));
        }
        if !pvc.km_hb.is_empty() {
            command.push_str(&format!(" --km-hb {}", join_ids(&pvc.km_hb)));
        }
        if pvc.no_rescale {
            command.push_str(" --no-rescale");
        }

        let node = Node::command("partial_volume_correction", command)
            .describe("Partial volume correction (PETSurfer mri_gtmpvc)")
            .input("in_file", PortKind::FilePath)
            .input("segmentation", PortKind::FilePath)
            .input("reg_file", PortKind::FilePath)
            .output("pvc_dir", PortKind::FilePath, "pvc")
            .option("psf", pvc.psf)
            .env("SUBJECTS_DIR", subjects_dir);

        // Region time courses are ports only when something consumes them
        if self.kinetic_modelling.is_some() {
            node.output("ref_file", PortKind::FilePath, "pvc/km.ref.tac.dat")
                .output("hb_file", PortKind::FilePath, "pvc/km.hb.tac.nii.gz")
        } else {
            node
        }
    }

    /// Output bindings mirroring the `preproc/` datasink layout
    fn add_outputs(&self, graph: &mut Graph, gtm_port: &str) {
        let mut collect = |node: &str, port: &str, name: String| {
            graph.outputs.push(OutputBinding {
                from: PortRef::new(node, port),
                name: format!("{}/{}", PREPROC, name),
                container: crate::pipeline::default_container(),
            });
        };

        collect("motion_correction", "out_file", format!("{}_desc-mc_pet.nii.gz", BIDS_STEM));
        if self.motion_correction.save_plots {
            collect("motion_correction", "par_file", format!("{}_desc-mc_motion.par", BIDS_STEM));
        }
        collect("time_weighted_average", "out_file", format!("{}_desc-twa_pet.nii.gz", BIDS_STEM));
        collect("coregistration", "out_lta_file", format!("{}_from-pet_to-T1w.lta", BIDS_STEM));
        collect("gtmseg", gtm_port, "gtmseg.mgz".to_string());
        collect("partial_volume_correction", "pvc_dir", "pvc".to_string());
        if self.kinetic_modelling.is_some() {
            collect("kinetic_modelling", "glm_dir", "mrtm1".to_string());
        }
    }
}

fn join_ids(ids: &[u32]) -> String {
    ids.iter().map(u32::to_string).collect::<Vec<_>>().join(" ")
}

fn invalid(field: &str, reason: String) -> FlowError {
    FlowError::InvalidConfig {
        reason: format!("{}: {}", field, reason),
        help: None,
    }
}
