//! End-to-end imputation runs over tiny synthetic panels: compress a
//! phased reference, impute a target cohort through the full pipeline, and
//! check the emitted records.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::Parser;

use remac::config::Config;
use remac::io::reference::compress_reference_panel;
use remac::pipelines::ImputationPipeline;

struct TestDir(PathBuf);

impl TestDir {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join("remac_e2e").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.0.join(name)
    }

    fn write(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path(name);
        File::create(&path)
            .unwrap()
            .write_all(body.as_bytes())
            .unwrap();
        path
    }
}

fn vcf_header(samples: &[&str]) -> String {
    format!(
        "##fileformat=VCFv4.2\n##phasing=full\n##contig=<ID=chr20>\n\
##FORMAT=<ID=GT,Number=1,Type=String,Description=\"Genotype\">\n\
#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\tFORMAT\t{}\n",
        samples.join("\t")
    )
}

/// Reference panel: 4 haplotypes over 5 variants at 100..500. Haplotypes
/// 0/1 carry the reference allele everywhere, 2/3 the alternate.
fn two_template_reference(dir: &TestDir) -> PathBuf {
    let mut body = vcf_header(&["R1", "R2"]);
    for pos in [100, 200, 300, 400, 500] {
        body.push_str(&format!(
            "chr20\t{}\tv{}\tA\tC\t.\tPASS\t.\tGT\t0|0\t1|1\n",
            pos, pos
        ));
    }
    let input = dir.write("ref.vcf", &body);
    let compressed = dir.path("ref.msav.vcf");
    compress_reference_panel(&input, &compressed, 1, 100, 10, None).unwrap();
    compressed
}

fn genetic_map(dir: &TestDir) -> PathBuf {
    dir.write(
        "map.txt",
        "#chrom\tpos\tcM\nchr20\t100\t0.00\nchr20\t500\t0.04\n",
    )
}

/// Parse output records into (pos, alt, info, format, sample columns).
fn read_output(path: &PathBuf) -> Vec<(u32, String, String, String, Vec<String>)> {
    let reader = BufReader::new(File::open(path).unwrap());
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line.unwrap();
        if line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        records.push((
            fields[1].parse().unwrap(),
            fields[4].to_string(),
            fields[7].to_string(),
            fields[8].to_string(),
            fields[9..].iter().map(|s| s.to_string()).collect(),
        ));
    }
    records
}

fn hds_values(format: &str, sample: &str) -> Vec<f32> {
    let slot = format
        .split(':')
        .position(|f| f == "HDS")
        .expect("HDS in FORMAT");
    sample
        .split(':')
        .nth(slot)
        .unwrap()
        .split(',')
        .map(|v| v.parse().unwrap())
        .collect()
}

fn run(args: &[&str]) -> remac::Result<()> {
    let config = Config::parse_from(args);
    config.validate()?;
    ImputationPipeline::new(config)?.run()
}

#[test]
fn imputes_untyped_sites_from_typed_observations() {
    let dir = TestDir::new("basic");
    let reference = two_template_reference(&dir);
    let map = genetic_map(&dir);

    // Target typed at 100 and 500 only; one diploid sample carrying one
    // all-ref and one all-alt haplotype, plus one haploid all-alt sample.
    let target = dir.write(
        "target.vcf",
        &format!(
            "{}chr20\t100\tv100\tA\tC\t.\tPASS\t.\tGT\t0|1\t1\n\
             chr20\t500\tv500\tA\tC\t.\tPASS\t.\tGT\t0|1\t1\n",
            vcf_header(&["T1", "T2"])
        ),
    );
    let output = dir.path("out.vcf");

    run(&[
        "remac",
        reference.to_str().unwrap(),
        target.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
        "--region",
        "chr20:1-1000",
        "--map",
        map.to_str().unwrap(),
        "--format",
        "GT,DS,HDS,GP,SD",
    ])
    .unwrap();

    let records = read_output(&output);
    assert_eq!(records.len(), 5, "one record per reference variant");

    for (pos, _, info, format, samples) in &records {
        let typed = *pos == 100 || *pos == 500;
        if typed {
            assert!(info.contains("TYPED"), "pos {} info {}", pos, info);
        } else {
            assert!(info.contains("IMPUTED"), "pos {} info {}", pos, info);
        }
        assert!(info.contains("R2="));

        // Diploid sample: hap 1 tracks ref, hap 2 tracks alt.
        let hds = hds_values(format, &samples[0]);
        assert_eq!(hds.len(), 2);
        assert!(hds[0] < 0.05, "pos {} hds {:?}", pos, hds);
        assert!(hds[1] > 0.95, "pos {} hds {:?}", pos, hds);

        // Haploid sample: a single dosage slot, tracking alt.
        let hds = hds_values(format, &samples[1]);
        assert_eq!(hds.len(), 1, "haploid sample has one HDS value");
        assert!(hds[0] > 0.95);

        let gt = samples[0].split(':').next().unwrap();
        assert_eq!(gt, "0|1");
        assert_eq!(samples[1].split(':').next().unwrap(), "1");
    }
}

#[test]
fn degenerate_panel_imputes_certain_alt() {
    let dir = TestDir::new("degenerate");
    // Every reference haplotype carries the alternate allele everywhere:
    // one unique template.
    let mut body = vcf_header(&["R1", "R2"]);
    for pos in [100, 200, 300] {
        body.push_str(&format!(
            "chr20\t{}\t.\tA\tC\t.\tPASS\t.\tGT\t1|1\t1|1\n",
            pos
        ));
    }
    let input = dir.write("ref.vcf", &body);
    let reference = dir.path("ref.msav.vcf");
    compress_reference_panel(&input, &reference, 1, 100, 10, None).unwrap();
    let map = genetic_map(&dir);

    let target = dir.write(
        "target.vcf",
        &format!(
            "{}chr20\t200\t.\tA\tC\t.\tPASS\t.\tGT\t1|1\n",
            vcf_header(&["T1"])
        ),
    );
    let output = dir.path("out.vcf");

    run(&[
        "remac",
        reference.to_str().unwrap(),
        target.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
        "--region",
        "chr20:1-1000",
        "--map",
        map.to_str().unwrap(),
    ])
    .unwrap();

    let records = read_output(&output);
    assert_eq!(records.len(), 3);
    for (pos, _, _, format, samples) in &records {
        let hds = hds_values(format, &samples[0]);
        assert_eq!(hds, vec![1.0, 1.0], "pos {}", pos);
    }
}

#[test]
fn min_ratio_gate_skips_or_fails() {
    let dir = TestDir::new("ratio_gate");
    let reference = two_template_reference(&dir);
    let map = genetic_map(&dir);

    // Only 1 of 5 reference sites is typed: ratio 0.2.
    let target = dir.write(
        "target.vcf",
        &format!(
            "{}chr20\t300\tv300\tA\tC\t.\tPASS\t.\tGT\t1|1\n",
            vcf_header(&["T1"])
        ),
    );

    let output = dir.path("skipped.vcf");
    run(&[
        "remac",
        reference.to_str().unwrap(),
        target.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
        "--region",
        "chr20:1-1000",
        "--map",
        map.to_str().unwrap(),
        "--min-ratio",
        "0.5",
        "--min-ratio-behavior",
        "skip",
    ])
    .unwrap();
    // The chunk was skipped with a success exit and no records written.
    assert!(read_output(&output).is_empty());

    let output = dir.path("failed.vcf");
    let err = run(&[
        "remac",
        reference.to_str().unwrap(),
        target.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
        "--region",
        "chr20:1-1000",
        "--map",
        map.to_str().unwrap(),
        "--min-ratio",
        "0.5",
        "--min-ratio-behavior",
        "fail",
    ]);
    assert!(err.is_err());
}

#[test]
fn target_only_sites_pass_through_when_requested() {
    let dir = TestDir::new("target_only");
    let reference = two_template_reference(&dir);
    let map = genetic_map(&dir);

    // Site 250 exists only in the target.
    let target = dir.write(
        "target.vcf",
        &format!(
            "{}chr20\t100\tv100\tA\tC\t.\tPASS\t.\tGT\t0|1\n\
             chr20\t250\tonly\tG\tT\t.\tPASS\t.\tGT\t1|0\n\
             chr20\t500\tv500\tA\tC\t.\tPASS\t.\tGT\t0|1\n",
            vcf_header(&["T1"])
        ),
    );

    let output = dir.path("with_passthrough.vcf");
    run(&[
        "remac",
        reference.to_str().unwrap(),
        target.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
        "--region",
        "chr20:1-1000",
        "--map",
        map.to_str().unwrap(),
        "--all-typed-sites",
    ])
    .unwrap();

    let records = read_output(&output);
    assert_eq!(records.len(), 6);
    let passthrough = records.iter().find(|r| r.0 == 250).unwrap();
    assert!(passthrough.2.contains("TYPED_ONLY"));
    assert_eq!(passthrough.3, "GT");
    assert_eq!(passthrough.4[0], "1|0");
    // Records stay position-sorted after interleaving.
    let positions: Vec<u32> = records.iter().map(|r| r.0).collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(positions, sorted);

    // Without the flag the site disappears.
    let output = dir.path("without_passthrough.vcf");
    run(&[
        "remac",
        reference.to_str().unwrap(),
        target.to_str().unwrap(),
        "-o",
        output.to_str().unwrap(),
        "--region",
        "chr20:1-1000",
        "--map",
        map.to_str().unwrap(),
    ])
    .unwrap();
    assert!(read_output(&output).iter().all(|r| r.0 != 250));
}

#[test]
fn batched_run_matches_single_batch() {
    let dir = TestDir::new("batching");
    let reference = two_template_reference(&dir);
    let map = genetic_map(&dir);

    // Three diploid samples with distinct haplotype mixes.
    let target = dir.write(
        "target.vcf",
        &format!(
            "{}chr20\t100\tv100\tA\tC\t.\tPASS\t.\tGT\t0|1\t1|1\t0|0\n\
             chr20\t300\tv300\tA\tC\t.\tPASS\t.\tGT\t0|1\t1|1\t0|0\n\
             chr20\t500\tv500\tA\tC\t.\tPASS\t.\tGT\t0|1\t1|1\t0|0\n",
            vcf_header(&["T1", "T2", "T3"])
        ),
    );

    let run_with_buffer = |name: &str, buffer: &str| -> Vec<_> {
        let output = dir.path(name);
        run(&[
            "remac",
            reference.to_str().unwrap(),
            target.to_str().unwrap(),
            "-o",
            output.to_str().unwrap(),
            "--region",
            "chr20:1-1000",
            "--map",
            map.to_str().unwrap(),
            "--temp-buffer",
            buffer,
            "--temp-prefix",
            dir.path("spool_").to_str().unwrap(),
        ])
        .unwrap();
        read_output(&output)
    };

    let single = run_with_buffer("single.vcf", "200");
    let batched = run_with_buffer("batched.vcf", "1");
    assert_eq!(single.len(), batched.len());
    for (a, b) in single.iter().zip(&batched) {
        assert_eq!(a, b, "temp-file merge must reproduce the in-memory path");
    }
}
