use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::command::{JobOutput, Supervisor};
use crate::config::Config;
use crate::error::{ServiceError, StoreError};
use crate::models::{
    unix_millis, ArtifactName, ConversionJob, ConvertedPdf, Invocation, ManifestEntry, UploadedInput,
};
use crate::store::ArtifactStore;

type PendingJob = JoinHandle<(usize, Result<ConvertedPdf, ServiceError>)>;

pub enum Dispatched {
    Single(ConvertedPdf),
    Batch(Vec<ManifestEntry>),
}

/// Turns uploads into conversion jobs and gathers their results.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: ArtifactStore,
    supervisor: Supervisor,
    public_url: String,
    max_batch_files: usize,
    purge_batch_orphans: bool,
}

impl Dispatcher {
    pub fn new(store: ArtifactStore, supervisor: Supervisor, config: &Config) -> Self {
        Dispatcher {
            store,
            supervisor,
            public_url: config.public_url.clone(),
            max_batch_files: config.max_batch_files,
            purge_batch_orphans: config.purge_batch_orphans,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn max_batch_files(&self) -> usize {
        self.max_batch_files
    }

    pub fn download_link(&self, name: &ArtifactName) -> String {
        format!("{}/download/{}", self.public_url, name)
    }

    /// One input is converted and handed back directly; several become a
    /// manifest of download links.
    pub async fn convert(&self, inputs: Vec<UploadedInput>) -> Result<Dispatched, ServiceError> {
        if inputs.len() > self.max_batch_files {
            return Err(ServiceError::Upload(format!(
                "At most {} files can be uploaded at once",
                self.max_batch_files
            )));
        }

        let mut inputs = inputs;
        match inputs.len() {
            0 => Err(ServiceError::Upload("No files uploaded!".to_owned())),
            1 => {
                let input = inputs.remove(0);
                Ok(Dispatched::Single(self.flatten(input).await?))
            }
            _ => Ok(Dispatched::Batch(self.flatten_batch(inputs).await?)),
        }
    }

    async fn flatten(&self, input: UploadedInput) -> Result<ConvertedPdf, ServiceError> {
        if tokio::fs::metadata(&input.path).await.is_err() {
            tracing::warn!(input = %input.name, "uploaded input vanished before conversion");
            return Err(ServiceError::NotFound(format!("{} not found", input.original_name)));
        }

        tracing::info!(
            input = %input.name,
            original = %input.original_name,
            content_type = %input.content_type,
            size = input.size,
            "accepted upload for conversion"
        );

        let artifact = ArtifactName::generate("converted", "pdf");
        let output = self.store.path_of(&artifact);
        let mut job = ConversionJob::new(input.path.clone(), Invocation::FlattenPdf { output });

        match self.supervisor.run(&mut job).await {
            Ok(JobOutput::File(path)) => {
                self.store.remove(&input.path).await;
                Ok(ConvertedPdf {
                    original_name: input.original_name,
                    artifact,
                    path,
                })
            }
            Ok(other) => Err(ServiceError::Aggregation(format!("unexpected converter result {other:?}"))),
            Err(source) => {
                tracing::warn!(
                    job_id = %job.id,
                    input = %input.name,
                    original = %input.original_name,
                    "leaving input in place after failed conversion"
                );
                Err(ServiceError::Job {
                    job_id: job.id.to_string(),
                    source,
                })
            }
        }
    }

    /// Starts every job at once. The first failure is returned immediately;
    /// siblings keep running and their outputs stay in the store.
    async fn flatten_batch(&self, inputs: Vec<UploadedInput>) -> Result<Vec<ManifestEntry>, ServiceError> {
        let total = inputs.len();
        tracing::info!(files = total, "starting batch conversion");

        let mut pending: FuturesUnordered<PendingJob> = inputs
            .into_iter()
            .enumerate()
            .map(|(index, input)| {
                let dispatcher = self.clone();
                tokio::spawn(async move { (index, dispatcher.flatten(input).await) })
            })
            .collect();

        let mut converted = Vec::with_capacity(total);

        while let Some(joined) = pending.next().await {
            match joined {
                Ok((index, Ok(pdf))) => converted.push((index, pdf)),
                Ok((_, Err(err))) => {
                    tracing::error!(error = %err, "batch conversion failed");
                    self.handle_orphans(converted.into_iter().map(|(_, pdf)| pdf).collect(), pending);
                    return Err(err);
                }
                Err(err) => {
                    self.handle_orphans(converted.into_iter().map(|(_, pdf)| pdf).collect(), pending);
                    return Err(ServiceError::Aggregation(err.to_string()));
                }
            }
        }

        converted.sort_by_key(|(index, _)| *index);

        Ok(converted
            .into_iter()
            .map(|(_, pdf)| ManifestEntry {
                download_link: self.download_link(&pdf.artifact),
                original_name: pdf.original_name,
                artifact_name: pdf.artifact.to_string(),
            })
            .collect())
    }

    fn handle_orphans(&self, finished: Vec<ConvertedPdf>, pending: FuturesUnordered<PendingJob>) {
        if !self.purge_batch_orphans {
            if !finished.is_empty() || !pending.is_empty() {
                tracing::warn!(
                    finished = finished.len(),
                    still_running = pending.len(),
                    "outputs of sibling jobs are left in the store"
                );
            }
            return;
        }

        let store = self.store.clone();
        tokio::spawn(async move {
            for pdf in finished {
                store.remove(&pdf.path).await;
            }

            let mut pending = pending;
            while let Some(joined) = pending.next().await {
                if let Ok((_, Ok(pdf))) = joined {
                    store.remove(&pdf.path).await;
                }
            }
        });
    }

    async fn resolve_csv(&self, csv: &str) -> Result<std::path::PathBuf, ServiceError> {
        match self.store.resolve(csv).await {
            Ok((_, path)) => Ok(path),
            Err(StoreError::Io(err)) => Err(ServiceError::Storage(err)),
            Err(err) => {
                tracing::warn!(csv, error = %err, "CSV file not found");
                Err(ServiceError::NotFound("CSV file not found.".to_owned()))
            }
        }
    }

    async fn run_csv(&self, csv: &str, invocation: Invocation) -> Result<JobOutput, ServiceError> {
        let path = self.resolve_csv(csv).await?;
        let mut job = ConversionJob::new(path, invocation);

        self.supervisor
            .run(&mut job)
            .await
            .map_err(|source| ServiceError::Job {
                job_id: job.id.to_string(),
                source,
            })
    }

    pub async fn list_clients(&self, csv: &str) -> Result<Vec<Value>, ServiceError> {
        match self.run_csv(csv, Invocation::ListClients).await? {
            JobOutput::Clients(clients) => {
                tracing::info!(csv, clients = clients.len(), "listed clients");
                Ok(clients)
            }
            other => Err(ServiceError::Aggregation(format!("unexpected converter result {other:?}"))),
        }
    }

    pub async fn convert_client(&self, csv: &str, client_index: u64) -> Result<ArtifactName, ServiceError> {
        let invocation = Invocation::ConvertClient {
            output_dir: self.store.root().to_path_buf(),
            client_index,
        };

        match self.run_csv(csv, invocation).await? {
            JobOutput::Fdf(name) => {
                tracing::info!(csv, client_index, fdf = %name, "converted client to FDF");
                Ok(name)
            }
            other => Err(ServiceError::Aggregation(format!("unexpected converter result {other:?}"))),
        }
    }

    pub async fn convert_all(&self, csv: &str) -> Result<ArtifactName, ServiceError> {
        let stem = ArtifactName::parse(csv).map(|name| name.stem().to_owned()).unwrap_or_default();
        let zip_name = ArtifactName::parse(&format!("{stem}_all_fdfs_{}.zip", unix_millis()))
            .ok_or_else(|| ServiceError::NotFound("CSV file not found.".to_owned()))?;

        let invocation = Invocation::ConvertAllToZip {
            output_dir: self.store.root().to_path_buf(),
            zip_path: self.store.path_of(&zip_name),
        };

        match self.run_csv(csv, invocation).await? {
            JobOutput::Zip(name) => {
                tracing::info!(csv, zip = %name, "bundled all clients");
                Ok(name)
            }
            other => Err(ServiceError::Aggregation(format!("unexpected converter result {other:?}"))),
        }
    }

    pub async fn generate_empty(&self, csv: &str) -> Result<ArtifactName, ServiceError> {
        let invocation = Invocation::GenerateEmptyFdf {
            output_dir: self.store.root().to_path_buf(),
        };

        match self.run_csv(csv, invocation).await? {
            JobOutput::Fdf(name) => {
                tracing::info!(csv, fdf = %name, "generated empty FDF template");
                Ok(name)
            }
            other => Err(ServiceError::Aggregation(format!("unexpected converter result {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ConverterCommand;
    use crate::testing::{fake_converter, TestDir};
    use std::time::{Duration, Instant};

    // Each fake input holds its client-facing name, so behaviour is keyed on content.
    const FLATTEN: &str = r#"body=$(cat "$1")
case "$body" in *bad*) echo "cannot read $body" >&2; exit 1;; esac
case "$body" in *slow*) sleep 1;; esac
cp "$1" "$2""#;

    const CSV: &str = r#"case "$2" in
list_clients) echo '[{"name":"Acme"},{"name":"Globex"}]';;
convert_client) echo fdf > "$3/client_$4.fdf"; echo "{\"fdf_filename\":\"client_$4.fdf\"}";;
convert_all_to_zip) echo zip > "$4"; echo "{\"zip_filename\":\"$(basename "$4")\"}";;
generate_empty_fdf) echo fdf > "$3/empty_template.fdf"; echo '{"fdf_filename":"empty_template.fdf"}';;
*) exit 2;;
esac"#;

    struct Fixture {
        dir: TestDir,
        store: ArtifactStore,
        dispatcher: Dispatcher,
    }

    fn fixture(purge_batch_orphans: bool) -> Fixture {
        let dir = TestDir::new();
        let store = ArtifactStore::open(dir.path().join("uploads")).unwrap();
        let pdf = fake_converter(&dir, "flatten.sh", FLATTEN);
        let fdf = fake_converter(&dir, "fdf.sh", CSV);
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.public_url = "http://localhost:3000".to_owned();
        config.purge_batch_orphans = purge_batch_orphans;
        config.max_batch_files = 3;

        let dispatcher = Dispatcher::new(store.clone(), Supervisor::new(pdf, fdf, None), &config);
        Fixture {
            dir,
            store,
            dispatcher,
        }
    }

    fn upload(store: &ArtifactStore, original_name: &str) -> UploadedInput {
        let name = ArtifactName::generate("upload", "pdf");
        let path = store.path_of(&name);
        std::fs::write(&path, original_name).unwrap();
        UploadedInput {
            path,
            name,
            original_name: original_name.to_owned(),
            content_type: "application/pdf".to_owned(),
            size: original_name.len() as u64,
        }
    }

    fn converted_outputs(store: &ArtifactStore) -> usize {
        std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("converted_"))
            .count()
    }

    async fn wait_for_outputs(store: &ArtifactStore, expected: usize) -> usize {
        for _ in 0..150 {
            if converted_outputs(store) == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        converted_outputs(store)
    }

    #[tokio::test]
    async fn no_inputs_is_an_upload_error() {
        let f = fixture(false);
        let result = f.dispatcher.convert(vec![]).await;
        assert!(matches!(result, Err(ServiceError::Upload(_))));
    }

    #[tokio::test]
    async fn too_many_inputs_is_an_upload_error() {
        let f = fixture(false);
        let inputs = (0..4).map(|i| upload(&f.store, &format!("doc{i}.pdf"))).collect();
        let result = f.dispatcher.convert(inputs).await;
        assert!(matches!(result, Err(ServiceError::Upload(_))));
    }

    #[tokio::test]
    async fn single_input_is_converted_and_its_input_removed() {
        let f = fixture(false);
        let input = upload(&f.store, "report.pdf");
        let input_path = input.path.clone();

        let Dispatched::Single(pdf) = f.dispatcher.convert(vec![input]).await.unwrap() else {
            panic!("expected single-mode result");
        };

        assert_eq!(pdf.original_name, "report.pdf");
        assert!(pdf.path.exists());
        assert_eq!(pdf.path, f.store.path_of(&pdf.artifact));
        assert!(!input_path.exists());
    }

    #[tokio::test]
    async fn failed_single_input_is_left_in_place() {
        let f = fixture(false);
        let input = upload(&f.store, "bad.pdf");
        let input_path = input.path.clone();

        let result = f.dispatcher.convert(vec![input]).await;

        assert!(matches!(result, Err(ServiceError::Job { .. })));
        assert!(input_path.exists());
    }

    #[tokio::test]
    async fn missing_input_is_not_found() {
        let f = fixture(false);
        let input = upload(&f.store, "gone.pdf");
        std::fs::remove_file(&input.path).unwrap();

        let result = f.dispatcher.convert(vec![input]).await;

        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn batch_success_returns_manifest_in_upload_order() {
        let f = fixture(false);
        let inputs = vec![upload(&f.store, "slow.pdf"), upload(&f.store, "b.pdf")];

        let Dispatched::Batch(manifest) = f.dispatcher.convert(inputs).await.unwrap() else {
            panic!("expected batch manifest");
        };

        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest[0].original_name, "slow.pdf");
        assert_eq!(manifest[1].original_name, "b.pdf");
        for entry in &manifest {
            assert_eq!(
                entry.download_link,
                format!("http://localhost:3000/download/{}", entry.artifact_name)
            );
            assert!(f.store.root().join(&entry.artifact_name).exists());
        }
    }

    #[tokio::test]
    async fn batch_jobs_run_concurrently() {
        let f = fixture(false);
        let inputs = vec![
            upload(&f.store, "slow1.pdf"),
            upload(&f.store, "slow2.pdf"),
            upload(&f.store, "slow3.pdf"),
        ];

        let started = Instant::now();
        f.dispatcher.convert(inputs).await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(2500), "took {:?}", started.elapsed());
    }

    #[tokio::test]
    async fn one_failure_fails_the_whole_batch_but_siblings_finish() {
        let f = fixture(false);
        let inputs = vec![
            upload(&f.store, "slow1.pdf"),
            upload(&f.store, "bad.pdf"),
            upload(&f.store, "slow2.pdf"),
        ];

        let result = f.dispatcher.convert(inputs).await;

        assert!(matches!(result, Err(ServiceError::Job { .. })));
        assert_eq!(wait_for_outputs(&f.store, 2).await, 2);
    }

    #[tokio::test]
    async fn orphans_are_purged_when_enabled() {
        let f = fixture(true);
        let inputs = vec![
            upload(&f.store, "slow1.pdf"),
            upload(&f.store, "bad.pdf"),
            upload(&f.store, "slow2.pdf"),
        ];

        let result = f.dispatcher.convert(inputs).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(wait_for_outputs(&f.store, 0).await, 0);
    }

    #[tokio::test]
    async fn csv_operations_report_converter_results() {
        let f = fixture(false);
        std::fs::write(f.store.root().join("upload_1_ab.csv"), b"name\nAcme\nGlobex\n").unwrap();

        let clients = f.dispatcher.list_clients("upload_1_ab.csv").await.unwrap();
        assert_eq!(clients.len(), 2);

        let fdf = f.dispatcher.convert_client("upload_1_ab.csv", 1).await.unwrap();
        assert_eq!(fdf.as_str(), "client_1.fdf");
        assert!(f.store.root().join("client_1.fdf").exists());

        let zip = f.dispatcher.convert_all("upload_1_ab.csv").await.unwrap();
        assert!(zip.as_str().starts_with("upload_1_ab_all_fdfs_"), "got {zip}");
        assert!(f.store.path_of(&zip).exists());

        let empty = f.dispatcher.generate_empty("upload_1_ab.csv").await.unwrap();
        assert_eq!(empty.as_str(), "empty_template.fdf");
    }

    #[tokio::test]
    async fn unknown_or_escaping_csv_is_not_found() {
        let f = fixture(false);
        std::fs::write(f.dir.path().join("outside.csv"), b"name\n").unwrap();

        for name in ["missing.csv", "../outside.csv"] {
            let result = f.dispatcher.list_clients(name).await;
            assert!(matches!(result, Err(ServiceError::NotFound(_))), "{name}");
        }
    }

    #[tokio::test]
    async fn unstartable_converter_is_a_job_error() {
        let f = fixture(false);
        let broken = ConverterCommand::new("/nonexistent/python", vec![]);
        let config = Config::from_lookup(|_| None).unwrap();
        let dispatcher = Dispatcher::new(
            f.store.clone(),
            Supervisor::new(broken.clone(), broken, None),
            &config,
        );
        std::fs::write(f.store.root().join("c.csv"), b"name\n").unwrap();

        let result = dispatcher.list_clients("c.csv").await;

        assert!(matches!(
            result,
            Err(ServiceError::Job {
                source: crate::error::JobError::Spawn { .. },
                ..
            })
        ));
    }
}
