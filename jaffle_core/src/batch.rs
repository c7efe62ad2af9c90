//! Batch driver: instruments loose class files and whole archives into an
//! output directory and injects the runtime support classes.

use crate::instrument::retry::{UnitStatus, instrument_unit};
use crate::instrument::{EdgeCounter, InstrumentOptions, Instrumenter};
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Unable to create output directory {path:?}: {source}")]
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Output directory {0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Archive error in {path:?}: {source}")]
    Archive {
        path: PathBuf,
        source: zip::result::ZipError,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BatchError + '_ {
    move |source| BatchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn zip_error(path: &Path) -> impl FnOnce(zip::result::ZipError) -> BatchError + '_ {
    move |source| BatchError::Archive {
        path: path.to_path_buf(),
        source,
    }
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BatchStats {
    /// Loose class files written, excluding already instrumented ones.
    pub class_files: u64,
    pub archives: u64,
    /// Units that received at least the marker, in files and archives.
    pub instrumented: u64,
    pub already_instrumented: u64,
    pub skipped: u64,
    pub malformed: u64,
    pub exhausted: u64,
    /// Inputs that could not be processed at all.
    pub failed_inputs: u64,
    /// Unreadable archive entries left out of the rewritten archive.
    pub failed_entries: u64,
    /// Signature files dropped from signed archives.
    pub dropped_signatures: u64,
    /// Coverage records spliced by the successful attempts.
    pub edges: u64,
}

impl BatchStats {
    fn count(&mut self, status: &UnitStatus) {
        match status {
            UnitStatus::Instrumented { .. } => self.instrumented += 1,
            UnitStatus::AlreadyInstrumented => self.already_instrumented += 1,
            UnitStatus::Skipped => self.skipped += 1,
            UnitStatus::Malformed => self.malformed += 1,
            UnitStatus::Exhausted => self.exhausted += 1,
        }
    }
}

/// One compiled support class, named by its archive path such as
/// `jaffle/Runtime.class`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportUnit {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Collects every `.class` file below `dir`, sorted by archive path.
pub fn load_support_units(dir: &Path) -> Result<Vec<SupportUnit>, BatchError> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<SupportUnit>) -> Result<(), BatchError> {
        for entry in fs::read_dir(dir).map_err(io_error(dir))? {
            let path = entry.map_err(io_error(dir))?.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else if path.extension().is_some_and(|ext| ext == "class") {
                let relative = path.strip_prefix(root).unwrap_or(&path);
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let bytes = fs::read(&path).map_err(io_error(&path))?;
                out.push(SupportUnit { name, bytes });
            }
        }
        Ok(())
    }

    let mut units = Vec::new();
    walk(dir, dir, &mut units)?;
    units.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(units)
}

/// Whether `name` belongs to a jar signature. Rewritten classes no longer
/// match the signed digests, so these entries cannot be kept.
fn is_signature_file(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    let upper = file.to_ascii_uppercase();
    upper.starts_with("SIG-")
        || [".SF", ".RSA", ".DSA", ".EC"]
            .iter()
            .any(|ext| upper.ends_with(ext))
}

/// Parent directories of `name` as archive directory entries, outermost
/// first: `a/b/C.class` gives `a/` and `a/b/`.
fn parent_dirs(name: &str) -> Vec<String> {
    name.match_indices('/')
        .map(|(index, _)| name[..=index].to_string())
        .collect()
}

pub struct Batch<'a> {
    instrumenter: &'a Instrumenter,
    options: InstrumentOptions,
    output_dir: PathBuf,
    support: Vec<SupportUnit>,
    edges: EdgeCounter,
    stats: BatchStats,
}

impl<'a> Batch<'a> {
    /// Prepares a run writing into `output_dir`, creating it when missing.
    pub fn new(
        instrumenter: &'a Instrumenter,
        options: InstrumentOptions,
        output_dir: &Path,
        support: Vec<SupportUnit>,
    ) -> Result<Self, BatchError> {
        if !output_dir.exists() {
            fs::create_dir_all(output_dir).map_err(|source| BatchError::OutputDir {
                path: output_dir.to_path_buf(),
                source,
            })?;
        }
        if !output_dir.is_dir() {
            return Err(BatchError::NotADirectory(output_dir.to_path_buf()));
        }
        Ok(Self {
            instrumenter,
            options,
            output_dir: output_dir.to_path_buf(),
            support,
            edges: EdgeCounter::new(),
            stats: BatchStats::default(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Processes one input. Failures are logged and counted; they never stop
    /// the batch.
    pub fn process(&mut self, input: &Path) {
        let result = if input.extension().is_some_and(|ext| ext == "class") {
            self.process_class_file(input)
        } else {
            self.process_archive(input)
        };
        if let Err(e) = result {
            error!("Failed to process {input:?}: {e}");
            self.stats.failed_inputs += 1;
        }
    }

    fn process_class_file(&mut self, input: &Path) -> Result<(), BatchError> {
        let data = fs::read(input).map_err(io_error(input))?;
        let file_name = input
            .file_name()
            .ok_or_else(|| BatchError::Io {
                path: input.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
            })?
            .to_os_string();
        let label = input.to_string_lossy();
        let outcome = instrument_unit(
            self.instrumenter,
            &label,
            &data,
            &self.options,
            &self.edges,
        );
        self.stats.count(&outcome.status);

        let mut target_dir = self.output_dir.clone();
        if let Some(parent) = outcome
            .class_name
            .as_deref()
            .and_then(|name| Path::new(name).parent())
        {
            target_dir.push(parent);
        }
        fs::create_dir_all(&target_dir).map_err(io_error(&target_dir))?;
        let target = target_dir.join(file_name);
        fs::write(&target, &outcome.bytes).map_err(io_error(&target))?;

        if outcome.status != UnitStatus::AlreadyInstrumented {
            self.stats.class_files += 1;
        }
        if let UnitStatus::Instrumented { edges, .. } = outcome.status {
            info!("Instrumented {edges} locations: {label}");
        }
        Ok(())
    }

    fn process_archive(&mut self, input: &Path) -> Result<(), BatchError> {
        let file = File::open(input).map_err(io_error(input))?;
        let mut archive = ZipArchive::new(BufReader::new(file)).map_err(zip_error(input))?;
        let file_name = input.file_name().ok_or_else(|| BatchError::Io {
            path: input.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"),
        })?;
        let target = self.output_dir.join(file_name);

        let temp = tempfile::Builder::new()
            .prefix(".jaffle-new-")
            .suffix(".jar")
            .tempfile_in(&self.output_dir)
            .map_err(io_error(&self.output_dir))?;
        let mut writer = ZipWriter::new(temp);
        let file_options =
            SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut seen = HashSet::new();

        for index in 0..archive.len() {
            let mut entry = match archive.by_index(index) {
                Ok(entry) => entry,
                Err(e) => {
                    error!("Leaving out entry {index} of {input:?}: {e}");
                    self.stats.failed_entries += 1;
                    continue;
                }
            };
            let name = entry.name().to_string();
            if is_signature_file(&name) {
                warn!("Dropping signature file {name} from {input:?}");
                self.stats.dropped_signatures += 1;
                continue;
            }
            if !seen.insert(name.clone()) {
                warn!("Dropping duplicate entry {name} in {input:?}");
                continue;
            }
            if entry.is_dir() {
                writer
                    .add_directory(name, file_options)
                    .map_err(zip_error(input))?;
                continue;
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            if let Err(e) = entry.read_to_end(&mut data) {
                error!("Leaving out unreadable entry {name} of {input:?}: {e}");
                self.stats.failed_entries += 1;
                continue;
            }
            let bytes = if name.ends_with(".class") {
                let label = format!("{}/{}", input.display(), name);
                let outcome =
                    instrument_unit(self.instrumenter, &label, &data, &self.options, &self.edges);
                self.stats.count(&outcome.status);
                outcome.bytes
            } else {
                data
            };
            writer
                .start_file(name, file_options)
                .map_err(zip_error(input))?;
            writer.write_all(&bytes).map_err(io_error(input))?;
        }

        for unit in &self.support {
            for dir in parent_dirs(&unit.name) {
                if seen.insert(dir.clone()) {
                    writer
                        .add_directory(dir, file_options)
                        .map_err(zip_error(input))?;
                }
            }
            if !seen.insert(unit.name.clone()) {
                warn!("{input:?} already contains {}, keeping it", unit.name);
                continue;
            }
            writer
                .start_file(unit.name.clone(), file_options)
                .map_err(zip_error(input))?;
            writer.write_all(&unit.bytes).map_err(io_error(input))?;
        }

        let temp = writer.finish().map_err(zip_error(input))?;
        temp.persist(&target)
            .map_err(|e| BatchError::Io {
                path: target.clone(),
                source: e.error,
            })?;
        self.stats.archives += 1;
        info!("Instrumented archive {input:?} into {target:?}");
        Ok(())
    }

    /// Writes the support classes next to the loose class files, if any were
    /// written, and returns the final counters.
    pub fn finish(mut self) -> Result<BatchStats, BatchError> {
        if self.stats.class_files > 0 {
            for unit in &self.support {
                let target = self.output_dir.join(&unit.name);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(io_error(parent))?;
                }
                fs::write(&target, &unit.bytes).map_err(io_error(&target))?;
            }
        }
        self.stats.edges = self.edges.get();
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::code::{IFEQ, RETURN};
    use crate::classfile::testutil::ClassBuilder;
    use crate::classfile::{ACC_PUBLIC, ACC_STATIC};
    use crate::coverage::DEFAULT_MAP_SIZE_POW2;
    use crate::instrument::marker::is_instrumented;
    use crate::instrument::{DEFAULT_MARKER, HookTargets};
    use tempfile::tempdir;

    fn sample_class(name: &str) -> Vec<u8> {
        ClassBuilder::new(name)
            .method(
                "pick",
                "(I)V",
                ACC_PUBLIC | ACC_STATIC,
                1,
                1,
                vec![0x1a, IFEQ, 0x00, 0x04, RETURN, RETURN],
                vec![],
            )
            .build()
    }

    fn support() -> Vec<SupportUnit> {
        vec![SupportUnit {
            name: "jaffle/Runtime.class".to_string(),
            bytes: sample_class("jaffle/Runtime"),
        }]
    }

    fn options() -> InstrumentOptions {
        InstrumentOptions {
            deterministic: true,
            ..InstrumentOptions::default()
        }
    }

    fn instrumenter() -> Instrumenter {
        Instrumenter::new(HookTargets::default(), DEFAULT_MAP_SIZE_POW2)
    }

    fn write_jar(path: &Path, entries: &[(&str, Option<&[u8]>)]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            match data {
                None => writer
                    .add_directory(*name, SimpleFileOptions::default())
                    .unwrap(),
                Some(data) => {
                    writer
                        .start_file(*name, SimpleFileOptions::default())
                        .unwrap();
                    writer.write_all(data).unwrap();
                }
            }
        }
        writer.finish().unwrap();
    }

    #[test]
    fn class_files_land_in_their_package_directory() -> Result<(), BatchError> {
        let input_dir = tempdir().unwrap();
        let output_dir = tempdir().unwrap();
        let input = input_dir.path().join("Branchy.class");
        fs::write(&input, sample_class("demo/pkg/Branchy")).unwrap();

        let instrumenter = instrumenter();
        let mut batch = Batch::new(&instrumenter, options(), output_dir.path(), support())?;
        batch.process(&input);
        let stats = batch.finish()?;

        assert_eq!(stats.class_files, 1);
        assert_eq!(stats.instrumented, 1);
        assert!(stats.edges >= 2, "One jump and one label at least");
        let written = fs::read(output_dir.path().join("demo/pkg/Branchy.class")).unwrap();
        assert!(is_instrumented(&written, DEFAULT_MARKER.as_bytes()));
        assert!(
            output_dir.path().join("jaffle/Runtime.class").is_file(),
            "Support classes must accompany loose class files"
        );
        let summary = serde_json::to_value(&stats).unwrap();
        assert_eq!(summary["class-files"], 1);
        assert_eq!(summary["edges"], stats.edges);

        // A second run over the output is a pure pass-through.
        let rerun_dir = tempdir().unwrap();
        let mut batch = Batch::new(&instrumenter, options(), rerun_dir.path(), support())?;
        batch.process(&output_dir.path().join("demo/pkg/Branchy.class"));
        let stats = batch.finish()?;
        assert_eq!(stats.already_instrumented, 1);
        assert_eq!(stats.class_files, 0);
        assert_eq!(stats.edges, 0);
        assert_eq!(
            fs::read(rerun_dir.path().join("demo/pkg/Branchy.class")).unwrap(),
            written
        );
        assert!(!rerun_dir.path().join("jaffle/Runtime.class").exists());
        Ok(())
    }

    #[test]
    fn archives_are_rewritten_with_support_classes() -> Result<(), BatchError> {
        let input_dir = tempdir().unwrap();
        let output_dir = tempdir().unwrap();
        let jar = input_dir.path().join("app.jar");
        let class = sample_class("demo/App");
        let manifest: &[u8] = b"Manifest-Version: 1.0\n";
        write_jar(
            &jar,
            &[
                ("META-INF/", None),
                ("META-INF/MANIFEST.MF", Some(manifest)),
                ("demo/", None),
                ("demo/App.class", Some(class.as_slice())),
            ],
        );

        let instrumenter = instrumenter();
        let mut batch = Batch::new(&instrumenter, options(), output_dir.path(), support())?;
        batch.process(&jar);
        let stats = batch.finish()?;
        assert_eq!(stats.archives, 1);
        assert_eq!(stats.instrumented, 1);
        assert_eq!(stats.class_files, 0);
        assert!(
            !output_dir.path().join("jaffle").exists(),
            "Support goes into the archive only"
        );

        let mut output = ZipArchive::new(File::open(output_dir.path().join("app.jar")).unwrap())
            .map_err(zip_error(&jar))?;
        let mut read = |name: &str| {
            let mut data = Vec::new();
            output
                .by_name(name)
                .unwrap()
                .read_to_end(&mut data)
                .unwrap();
            data
        };
        assert_eq!(read("META-INF/MANIFEST.MF"), manifest);
        assert!(is_instrumented(&read("demo/App.class"), DEFAULT_MARKER.as_bytes()));
        assert_eq!(read("jaffle/Runtime.class"), support()[0].bytes);
        assert!(output.by_name("jaffle/").is_ok());
        Ok(())
    }

    #[test]
    fn archive_entries_shadow_support_classes() -> Result<(), BatchError> {
        let input_dir = tempdir().unwrap();
        let output_dir = tempdir().unwrap();
        let jar = input_dir.path().join("lib.jar");
        write_jar(&jar, &[("jaffle/Runtime.class", Some(&b"custom"[..]))]);

        let instrumenter = instrumenter();
        let mut batch = Batch::new(&instrumenter, options(), output_dir.path(), support())?;
        batch.process(&jar);
        let stats = batch.finish()?;
        assert_eq!(stats.skipped, 1, "Six bytes are not a class file");

        let mut output = ZipArchive::new(File::open(output_dir.path().join("lib.jar")).unwrap())
            .map_err(zip_error(&jar))?;
        assert_eq!(output.len(), 2, "Directory entry plus the original class");
        let mut data = Vec::new();
        output
            .by_name("jaffle/Runtime.class")
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        assert_eq!(data, b"custom");
        Ok(())
    }

    #[test]
    fn failing_inputs_do_not_stop_the_batch() -> Result<(), BatchError> {
        let input_dir = tempdir().unwrap();
        let output_dir = tempdir().unwrap();
        let not_a_jar = input_dir.path().join("notes.txt");
        fs::write(&not_a_jar, "plain text").unwrap();
        let good = input_dir.path().join("Good.class");
        fs::write(&good, sample_class("Good")).unwrap();

        let instrumenter = instrumenter();
        let mut batch = Batch::new(&instrumenter, options(), output_dir.path(), Vec::new())?;
        batch.process(&input_dir.path().join("Missing.class"));
        batch.process(&not_a_jar);
        batch.process(&good);
        let stats = batch.finish()?;
        assert_eq!(stats.failed_inputs, 2);
        assert_eq!(stats.class_files, 1);
        assert!(output_dir.path().join("Good.class").is_file());

        let leftovers: Vec<_> = fs::read_dir(output_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".jaffle-new-"))
            .collect();
        assert!(leftovers.is_empty(), "Temporary archives must be cleaned up");
        Ok(())
    }

    #[test]
    fn unreadable_entries_are_left_out() -> Result<(), BatchError> {
        let input_dir = tempdir().unwrap();
        let output_dir = tempdir().unwrap();
        let jar = input_dir.path().join("broken.jar");
        let payload = b"resource bytes that get corrupted";
        let class = sample_class("demo/Kept");
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let mut writer = ZipWriter::new(File::create(&jar).unwrap());
        writer.start_file("demo/data.bin", stored).unwrap();
        writer.write_all(payload).unwrap();
        writer.start_file("demo/Kept.class", stored).unwrap();
        writer.write_all(&class).unwrap();
        writer.finish().unwrap();

        // Damage the stored bytes so the entry fails its checksum.
        let mut bytes = fs::read(&jar).unwrap();
        let offset = bytes
            .windows(payload.len())
            .position(|window| window == payload)
            .unwrap();
        bytes[offset] ^= 0xff;
        fs::write(&jar, bytes).unwrap();

        let instrumenter = instrumenter();
        let mut batch = Batch::new(&instrumenter, options(), output_dir.path(), Vec::new())?;
        batch.process(&jar);
        let stats = batch.finish()?;
        assert_eq!(stats.failed_entries, 1);
        assert_eq!(stats.failed_inputs, 0);
        assert_eq!(stats.archives, 1);
        assert_eq!(stats.instrumented, 1);

        let output = ZipArchive::new(File::open(output_dir.path().join("broken.jar")).unwrap())
            .map_err(zip_error(&jar))?;
        let names: Vec<_> = output.file_names().collect();
        assert_eq!(names, vec!["demo/Kept.class"]);
        Ok(())
    }

    #[test]
    fn signed_archives_lose_their_signatures() -> Result<(), BatchError> {
        assert!(is_signature_file("META-INF/ECLIPSE_.SF"));
        assert!(is_signature_file("META-INF/ECLIPSE_.RSA"));
        assert!(is_signature_file("META-INF/sig-app"));
        assert!(!is_signature_file("META-INF/MANIFEST.MF"));
        assert!(!is_signature_file("META-INF/services/a.SF"));
        assert!(!is_signature_file("demo/KEY.RSA"));

        let input_dir = tempdir().unwrap();
        let output_dir = tempdir().unwrap();
        let jar = input_dir.path().join("signed.jar");
        let class = sample_class("demo/Signed");
        write_jar(
            &jar,
            &[
                ("META-INF/MANIFEST.MF", Some(&b"Manifest-Version: 1.0\n"[..])),
                ("META-INF/SIGNER.SF", Some(&b"Signature-Version: 1.0\n"[..])),
                ("META-INF/SIGNER.RSA", Some(&b"\x30\x82"[..])),
                ("demo/Signed.class", Some(class.as_slice())),
            ],
        );

        let instrumenter = instrumenter();
        let mut batch = Batch::new(&instrumenter, options(), output_dir.path(), Vec::new())?;
        batch.process(&jar);
        let stats = batch.finish()?;
        assert_eq!(stats.dropped_signatures, 2);
        assert_eq!(stats.instrumented, 1);

        let output = ZipArchive::new(File::open(output_dir.path().join("signed.jar")).unwrap())
            .map_err(zip_error(&jar))?;
        let mut names: Vec<_> = output.file_names().collect();
        names.sort();
        assert_eq!(names, vec!["META-INF/MANIFEST.MF", "demo/Signed.class"]);
        Ok(())
    }

    #[test]
    fn output_must_be_a_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let instrumenter = instrumenter();
        assert!(matches!(
            Batch::new(&instrumenter, options(), file.path(), Vec::new()),
            Err(BatchError::NotADirectory(_))
        ));
    }

    #[test]
    fn support_units_keep_their_relative_paths() -> Result<(), BatchError> {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("jaffle/inner")).unwrap();
        fs::write(dir.path().join("jaffle/Runtime.class"), b"a").unwrap();
        fs::write(dir.path().join("jaffle/inner/Helper.class"), b"b").unwrap();
        fs::write(dir.path().join("jaffle/README"), b"c").unwrap();
        let units = load_support_units(dir.path())?;
        let names: Vec<_> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["jaffle/Runtime.class", "jaffle/inner/Helper.class"]);
        assert_eq!(parent_dirs("a/b/C.class"), vec!["a/", "a/b/"]);
        Ok(())
    }
}
