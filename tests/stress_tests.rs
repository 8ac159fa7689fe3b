//! Stress tests: deep expansion, wide reps and long runs.

use flipjump::{
    assemble_and_run, assemble_source, AssembleOptions, AssemblerError, RunConfig,
    TerminationCause,
};

fn limited(steps: u64) -> RunConfig {
    RunConfig {
        step_limit: Some(steps),
        ..Default::default()
    }
}

#[test]
fn nesting_just_under_the_depth_limit_works() {
    // d0 calls d1 calls ... d899's body is a single op: depth 900
    // invocations, right at the configured boundary.
    let depth = 899;
    let mut source = String::new();
    for level in (0..depth).rev() {
        if level == depth - 1 {
            source.push_str(&format!("def d{} {{\n  ;\n}}\n", level));
        } else {
            source.push_str(&format!("def d{} {{\n  d{}\n}}\n", level, level + 1));
        }
    }
    source.push_str("d0\nstop: ;stop\n");

    let assembly = assemble_source("deep.fj", &source, &AssembleOptions::default()).unwrap();
    assert!(!assembly.image.segments.is_empty());
}

#[test]
fn nesting_past_the_depth_limit_fails() {
    let depth = 901;
    let mut source = String::new();
    for level in (0..depth).rev() {
        if level == depth - 1 {
            source.push_str(&format!("def d{} {{\n  ;\n}}\n", level));
        } else {
            source.push_str(&format!("def d{} {{\n  d{}\n}}\n", level, level + 1));
        }
    }
    source.push_str("d0\n");

    let err = assemble_source("deep.fj", &source, &AssembleOptions::default()).unwrap_err();
    assert!(matches!(err, AssemblerError::MacroRecursion { .. }));
}

#[test]
fn wide_rep_expansion() {
    // 4096 hygienic invocations, each with its own label.
    let source = "\
def cell {
  here: ;$
}
rep(4096, i) cell
stop: ;stop
";
    let assembly = assemble_source("wide.fj", source, &AssembleOptions::default()).unwrap();
    let generated = assembly
        .labels
        .keys()
        .filter(|name| name.ends_with(".here"))
        .count();
    assert_eq!(generated, 4096);
}

#[test]
fn long_fall_through_run() {
    // 20k ops falling through, then a self-loop.
    let source = "rep(20000, i) ;\nstop: ;stop\n";
    let summary = assemble_and_run(
        "long.fj",
        source,
        b"",
        &AssembleOptions::default(),
        limited(50_000),
    )
    .unwrap();
    assert_eq!(summary.cause, TerminationCause::Looping);
    assert_eq!(summary.steps, 20_001);
}

#[test]
fn many_wflip_chains_share_the_area() {
    // Every op wflips a wide constant into the same word; the chains
    // stack up in the single region's wflip area.
    let source = "\
target: ;target
rep(64, i) go
def go {
  wflip target+w, 0xFF00
}
stop: ;stop
";
    let assembly = assemble_source("chains.fj", source, &AssembleOptions::default()).unwrap();
    // 8 set bits per wflip: 1 inline op + 7 chain ops each.
    let area = assembly
        .image
        .segments
        .iter()
        .map(|segment| segment.data.len() as u64 / 16)
        .sum::<u64>();
    assert_eq!(area, 1 + 64 + 1 + 64 * 7);
}
