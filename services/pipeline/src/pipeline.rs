//! Unit scheduling for one pipeline run.
//!
//! Every (provider, variable) pair becomes a job: fetch, harmonize, then
//! compute and write every product unit for it on the blocking pool. Unit
//! failures are collected rather than propagated. Outputs of all jobs are
//! merged into the store in one batch, and the store is then published.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use clim_common::{
    ClimatologyRecord, ErrorScope, HarmonizedField, LatLonGrid, Period, PipelineError,
    PipelineResult, RegionSeriesRecord, TimeFilter, TimeRange,
};
use climatology::{compute_anomaly, resample, ClimatologyEngine, ConservativeRemap};
use harmonizer::Harmonizer;
use product_store::{OutputWriter, Publisher, RunOutput, StoreConfig, StoreKey, StoreMerger};
use regions::{RegionAggregator, RegionMask, RegionSet};
use sources::{Source, SourceAdapter};

use crate::config::{PeriodsConfig, PipelineConfig, SeriesFrequency};
use crate::manifest::{FailedKey, FailedUnit, PublicationSummary, RunManifest};

/// State shared by every job of a run.
struct RunContext {
    harmonizer: Harmonizer,
    engine: ClimatologyEngine,
    aggregator: RegionAggregator,
    regions: RegionSet,
    periods: PeriodsConfig,
    time_filters: Vec<TimeFilter>,
    series_frequency: SeriesFrequency,
    store_config: StoreConfig,
    range: TimeRange,
    /// Common grid for gridded products.
    target_grid: Option<LatLonGrid>,
}

/// Where gridded records go: remapped onto the common grid if one is set.
struct GriddedSink<'a> {
    writer: &'a OutputWriter,
    remap: Option<ConservativeRemap>,
}

impl GriddedSink<'_> {
    fn write(&self, record: &ClimatologyRecord) -> PipelineResult<RunOutput> {
        match &self.remap {
            Some(remap) => write_record(self.writer, &remap.apply(record)?),
            None => write_record(self.writer, record),
        }
    }
}

/// What one (provider, variable) job produced.
#[derive(Default)]
struct JobResult {
    outputs: Vec<RunOutput>,
    failures: Vec<FailedUnit>,
}

/// Identity of a unit, for failure reports.
#[derive(Clone)]
struct Unit<'a> {
    provider: &'a str,
    variable: &'a str,
    selector: Option<String>,
    time_filter: Option<String>,
    product: Option<&'static str>,
}

impl<'a> Unit<'a> {
    fn job(provider: &'a str, variable: &'a str) -> Self {
        Self {
            provider,
            variable,
            selector: None,
            time_filter: None,
            product: None,
        }
    }

    fn at(&self, selector: impl Into<String>, filter: &TimeFilter, product: &'static str) -> Self {
        Self {
            selector: Some(selector.into()),
            time_filter: Some(filter.label()),
            product: Some(product),
            ..self.clone()
        }
    }

    fn failed(&self, err: &PipelineError) -> FailedUnit {
        warn!(
            provider = %self.provider,
            variable = %self.variable,
            selector = self.selector.as_deref().unwrap_or("*"),
            time_filter = self.time_filter.as_deref().unwrap_or("*"),
            product = self.product.unwrap_or("*"),
            kind = err.kind(),
            reason = %err,
            "Unit failed"
        );
        FailedUnit {
            provider: self.provider.to_string(),
            variable: self.variable.to_string(),
            selector: self.selector.clone(),
            time_filter: self.time_filter.clone(),
            product: self.product.map(str::to_string),
            scope: err.scope(),
            kind: err.kind().to_string(),
            reason: err.to_string(),
        }
    }
}

impl JobResult {
    fn failure(unit: &Unit<'_>, err: &PipelineError) -> Self {
        Self {
            outputs: Vec::new(),
            failures: vec![unit.failed(err)],
        }
    }

    fn record(&mut self, unit: Unit<'_>, result: PipelineResult<RunOutput>) {
        match result {
            Ok(output) => {
                debug!(key = %output.key, "Wrote unit output");
                self.outputs.push(output);
            }
            Err(err) => self.failures.push(unit.failed(&err)),
        }
    }
}

pub struct Pipeline {
    context: Arc<RunContext>,
    sources: Vec<Arc<Source>>,
    variables: Vec<String>,
    parallelism: usize,
    output_dir: PathBuf,
    merger: StoreMerger,
    publisher: Option<Publisher>,
    /// Providers that could not be opened during setup.
    setup_failures: Vec<FailedUnit>,
}

impl Pipeline {
    /// Build the pipeline described by `config`.
    ///
    /// Providers that cannot be opened are reported as failed units; setup
    /// fails only when none can be opened.
    pub fn from_config(config: PipelineConfig, skip_publish: bool) -> Result<Self> {
        let mut sources = Vec::new();
        let mut setup_failures = Vec::new();
        for provider in &config.providers {
            match Source::from_config(provider) {
                Ok(source) => sources.push(source),
                Err(err) => {
                    for variable in &config.variables {
                        setup_failures.push(Unit::job(provider.name(), variable).failed(&err));
                    }
                }
            }
        }
        anyhow::ensure!(
            !sources.is_empty(),
            "None of the {} configured providers could be opened",
            config.providers.len()
        );

        let publisher = match (&config.publish, skip_publish) {
            (Some(publish), false) => Some(
                Publisher::from_config(publish.clone())
                    .context("Failed to set up store publication")?,
            ),
            _ => None,
        };

        let mut pipeline = Self::with_sources(config, sources, publisher)?;
        pipeline.setup_failures = setup_failures;
        Ok(pipeline)
    }

    /// Build a pipeline over already constructed sources.
    pub fn with_sources(
        config: PipelineConfig,
        sources: Vec<Source>,
        publisher: Option<Publisher>,
    ) -> Result<Self> {
        let harmonizer =
            Harmonizer::from_path(&config.tables, config.thresholds.max_invalid_fraction)
                .with_context(|| format!("Failed to load tables from {:?}", config.tables))?;
        let regions = RegionSet::load(&config.regions.path, &config.regions.name_property)
            .with_context(|| format!("Failed to load regions from {:?}", config.regions.path))?;
        let aggregator = RegionAggregator::new(config.thresholds.region_min_valid_fraction)?;

        let settings = config.climatology_settings();
        settings.validate().map_err(anyhow::Error::msg)?;
        let range = config
            .periods
            .time_range()
            .context("No analysis period configured")?;

        let merger = StoreMerger::open(&config.store.root)
            .with_context(|| format!("Failed to open store at {:?}", config.store.root))?;

        info!(
            providers = sources.len(),
            variables = config.variables.len(),
            decades = config.periods.decades.len(),
            time_filters = config.time_filters.len(),
            regions = regions.len(),
            publish = publisher.is_some(),
            "Pipeline ready"
        );

        Ok(Self {
            context: Arc::new(RunContext {
                harmonizer,
                engine: ClimatologyEngine::new(settings),
                aggregator,
                regions,
                periods: config.periods,
                time_filters: config.time_filters,
                series_frequency: config.series_frequency,
                store_config: config.store,
                range,
                target_grid: config.regrid.map(|r| r.target_grid()),
            }),
            sources: sources.into_iter().map(Arc::new).collect(),
            variables: config.variables,
            parallelism: config.parallelism,
            output_dir: config.output_dir,
            merger,
            publisher,
            setup_failures: Vec::new(),
        })
    }

    pub fn merger(&self) -> &StoreMerger {
        &self.merger
    }

    /// Run every job, merge the outputs and publish the store.
    ///
    /// Unit and key failures end up in the manifest. An error is returned
    /// only when the run cannot proceed at all.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<RunManifest> {
        let run_id = Uuid::new_v4();
        let run_dir = self.output_dir.join(run_id.to_string());
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create run directory {:?}", run_dir))?;
        let mut manifest =
            RunManifest::new(run_id, run_dir.clone(), self.merger.root().to_path_buf());
        manifest.failed_units.extend(self.setup_failures.iter().cloned());
        info!(run_id = %run_id, run_dir = %run_dir.display(), "Starting run");

        // Jobs
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut handles = Vec::new();
        for source in &self.sources {
            for variable in &self.variables {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .context("Job scheduler closed")?;
                let context = self.context.clone();
                let job_source = source.clone();
                let job_variable = variable.clone();
                let run_dir = run_dir.clone();

                let handle = tokio::spawn(async move {
                    let result =
                        process_variable(context, job_source, &job_variable, run_dir).await;
                    drop(permit);
                    result
                });
                handles.push((source.provider().to_string(), variable.clone(), handle));
            }
        }

        let mut outputs = Vec::new();
        for (provider, variable, handle) in handles {
            match handle.await {
                Ok(result) => {
                    outputs.extend(result.outputs);
                    manifest.failed_units.extend(result.failures);
                }
                Err(e) => {
                    let err = PipelineError::Io(format!("job task failed: {}", e));
                    let mut failed = Unit::job(&provider, &variable).failed(&err);
                    failed.scope = ErrorScope::Unit;
                    manifest.failed_units.push(failed);
                }
            }
        }
        manifest.succeeded_units = outputs.len();
        info!(
            outputs = outputs.len(),
            failed_units = manifest.failed_units.len(),
            "Jobs complete"
        );

        // Merge
        let report = self.merger.merge(outputs).await;
        manifest.store_generation = report.store.generation;
        manifest.written_keys = report.written.iter().map(StoreKey::path).collect();
        manifest.unchanged_keys = report.unchanged.iter().map(StoreKey::path).collect();
        manifest.failed_merges = report
            .failed
            .iter()
            .map(|(key, err)| FailedKey::new(key.path(), err))
            .collect();

        // Publish
        if let Some(publisher) = &self.publisher {
            let mut summary = PublicationSummary::default();
            match publisher.publish(self.merger.root()).await {
                Ok(report) => {
                    summary.uploaded = report.uploaded;
                    summary.skipped = report.skipped;
                    summary.deleted_objects = report.deleted_objects;
                    summary.failed = report
                        .failed
                        .iter()
                        .map(|(key, err)| FailedKey::new(key.as_str(), err))
                        .collect();
                }
                Err(e) => {
                    error!(error = %e, "Publication failed");
                    summary.error = Some(e.to_string());
                }
            }
            manifest.publication = Some(summary);
        }

        manifest.finished_at = Some(Utc::now());
        info!(
            run_id = %run_id,
            succeeded_units = manifest.succeeded_units,
            failed_units = manifest.failed_units.len(),
            written_keys = manifest.written_keys.len(),
            unchanged_keys = manifest.unchanged_keys.len(),
            failed_merges = manifest.failed_merges.len(),
            generation = manifest.store_generation,
            "Run complete"
        );
        Ok(manifest)
    }
}

/// Fetch and harmonize one variable, then compute its products.
async fn process_variable(
    context: Arc<RunContext>,
    source: Arc<Source>,
    variable: &str,
    run_dir: PathBuf,
) -> JobResult {
    let provider = source.provider().to_string();
    let unit = Unit::job(&provider, variable);

    let raw = match fetch_variable(&context, &source, variable).await {
        Ok(raw) => raw,
        Err(err) => return JobResult::failure(&unit, &err),
    };

    let blocking_provider = provider.clone();
    let blocking_variable = variable.to_string();
    let computed = tokio::task::spawn_blocking(move || {
        let field = match context.harmonizer.harmonize(raw) {
            Ok(field) => field,
            Err(err) => {
                let unit = Unit::job(&blocking_provider, &blocking_variable);
                return JobResult::failure(&unit, &err);
            }
        };
        let writer = OutputWriter::new(context.store_config.clone(), run_dir);
        context.compute_products(&field, &writer)
    })
    .await;

    match computed {
        Ok(result) => result,
        Err(e) => JobResult::failure(&unit, &PipelineError::Io(format!("compute task failed: {}", e))),
    }
}

/// First native name of `variable` the source offers.
async fn fetch_variable(
    context: &RunContext,
    source: &Source,
    variable: &str,
) -> PipelineResult<clim_common::RawField> {
    let provider = source.provider();
    let offered = source.list_variables().await?;
    let candidates = context.harmonizer.tables().native_names(provider, variable);
    let native = candidates
        .iter()
        .find(|name| offered.contains(*name))
        .ok_or_else(|| PipelineError::VariableNotFound {
            provider: provider.to_string(),
            variable: variable.to_string(),
        })?;
    debug!(provider = %provider, variable = %variable, native_name = %native, "Fetching");
    source.fetch(native, &context.range).await
}

impl RunContext {
    /// Every product unit of one harmonized field. Runs on the blocking pool.
    fn compute_products(&self, field: &HarmonizedField, writer: &OutputWriter) -> JobResult {
        let provider = field.provenance.provider.clone();
        let variable = field.descriptor.canonical_name.clone();
        let unit = Unit::job(&provider, &variable);
        let mut result = JobResult::default();

        let remap = match &self.target_grid {
            Some(target) => match ConservativeRemap::new(&field.grid, target) {
                Ok(remap) => Some(remap),
                Err(err) => return JobResult::failure(&unit, &err),
            },
            None => None,
        };
        let sink = GriddedSink { writer, remap };

        for filter in &self.time_filters {
            let reference = self.reference_mean(field, filter, &sink, &unit, &mut result);

            for decade in &self.periods.decades {
                self.decade_products(field, decade, filter, reference.as_ref(), &sink, &unit, &mut result);
            }

            self.series_products(field, filter, writer, &unit, &mut result);
        }

        info!(
            provider = %provider,
            variable = %variable,
            outputs = result.outputs.len(),
            failures = result.failures.len(),
            "Computed products"
        );
        result
    }

    /// Mean over the reference period, written as a climatology product
    /// unless it coincides with an analysis decade.
    fn reference_mean(
        &self,
        field: &HarmonizedField,
        filter: &TimeFilter,
        sink: &GriddedSink<'_>,
        unit: &Unit<'_>,
        result: &mut JobResult,
    ) -> Option<ClimatologyRecord> {
        let reference = self.periods.reference?;
        let unit = unit.at(reference.label(), filter, "climatology");
        match self.engine.compute_climatology(field, &reference, *filter) {
            Ok(record) => {
                if !self.periods.decades.contains(&reference) {
                    result.record(unit, sink.write(&record));
                }
                Some(record)
            }
            Err(err) => {
                result.failures.push(unit.failed(&err));
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn decade_products(
        &self,
        field: &HarmonizedField,
        decade: &Period,
        filter: &TimeFilter,
        reference: Option<&ClimatologyRecord>,
        sink: &GriddedSink<'_>,
        unit: &Unit<'_>,
        result: &mut JobResult,
    ) {
        let label = decade.label();

        let mean = self.engine.compute_climatology(field, decade, *filter);
        match &mean {
            Ok(record) => result.record(unit.at(&label, filter, "climatology"), sink.write(record)),
            Err(err) => result.failures.push(unit.at(&label, filter, "climatology").failed(err)),
        }

        match self.engine.compute_trend(field, decade, *filter) {
            Ok(trend) => {
                result.record(unit.at(&label, filter, "trend_slope"), sink.write(&trend.slope));
                result.record(
                    unit.at(&label, filter, "trend_intercept"),
                    sink.write(&trend.intercept),
                );
                result.record(
                    unit.at(&label, filter, "trend_pvalue"),
                    sink.write(&trend.pvalue),
                );
            }
            Err(err) => result.failures.push(unit.at(&label, filter, "trend").failed(&err)),
        }

        // A failed mean or reference is already reported above.
        if let (Ok(mean), Some(reference)) = (&mean, reference) {
            let anomaly = compute_anomaly(mean, reference).and_then(|record| sink.write(&record));
            result.record(unit.at(&label, filter, "anomaly"), anomaly);
        }
    }

    /// Regional series for every region under one time filter.
    fn series_products(
        &self,
        field: &HarmonizedField,
        filter: &TimeFilter,
        writer: &OutputWriter,
        unit: &Unit<'_>,
        result: &mut JobResult,
    ) {
        let all_regions = unit.at("*", filter, "region_series");
        let records = match self.series_records(field, filter) {
            Ok(records) => records,
            Err(err) => {
                result.failures.push(all_regions.failed(&err));
                return;
            }
        };

        let mut by_region: BTreeMap<String, Vec<RegionSeriesRecord>> = BTreeMap::new();
        for record in records {
            by_region.entry(record.region_name.clone()).or_default().push(record);
        }
        for (region, records) in by_region {
            let key = StoreKey::for_series(&field.descriptor, unit.provider, &region, filter);
            let output = writer
                .write_series(key.clone(), &field.descriptor, &field.provenance, &records)
                .map_err(|e| e.into_pipeline(&key.path()));
            result.record(unit.at(region, filter, "region_series"), output);
        }
    }

    fn series_records(
        &self,
        field: &HarmonizedField,
        filter: &TimeFilter,
    ) -> PipelineResult<Vec<RegionSeriesRecord>> {
        let series_field = match self.series_frequency {
            SeriesFrequency::Native => {
                let selected = field.select_times(|t| filter.selects(t));
                if selected.n_times() == 0 {
                    return Err(PipelineError::insufficient_data(
                        &field.descriptor.canonical_name,
                        format!("filter {} selects no timesteps", filter),
                    ));
                }
                selected
            }
            SeriesFrequency::Resampled => {
                resample(field, *filter, filter.min_values(field.frequency))?
            }
        };
        let masks = RegionMask::build_all(self.regions.regions(), &series_field.grid)?;
        self.aggregator.aggregate_masks(&series_field, &masks)
    }
}

fn write_record(writer: &OutputWriter, record: &ClimatologyRecord) -> PipelineResult<RunOutput> {
    writer
        .write_record(record)
        .map_err(|e| e.into_pipeline(&StoreKey::for_record(record).path()))
}
