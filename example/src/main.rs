use mvlc_analysis::filter::DataFilter;
use mvlc_analysis::graph::{AnalysisGraph, AnalysisRuntime, DataSource, NodeRef, OperatorDef, OperatorKind, SinkDef, SinkKind, SinkState, Slot};
use mvlc_analysis::splitter::{MultiEventSplitter, SplitterConfig};
use mvlc_analysis::worker::{RunDescriptor, StreamFormat, StreamOutcome, StreamWorker, StreamWorkerHandle};
use mvlc_daq::config::{CrateConfig, EventConfig, ModuleConfig};
use mvlc_daq::listfile::{ListfileFormat, ListfileWriterConfig, SplitListfileWriter, SplitMode};
use mvlc_daq::parser::ReadoutParser;
use mvlc_daq::readout::{ReplayWorker, WorkerHandle};
use mvlc_stack::frame::{make_frame_header, make_stack_frame_header, FrameFlags, FrameType};
use mvlc_stack::trigger::{compute_trigger_value, TriggerCondition};
use mvlc_stack::{superc, AddressModifier, DataWidth, ScriptCommand};
use std::sync::Arc;
use std::time::Duration;

fn main() {
  //LOGGING
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  //CRATE CONFIG
  //
  //One readout event triggered by IRQ1: an madc32 whose event memory is
  //read with a 64-bit fifo block transfer, followed by the readout-reset
  //register write.
  let config: CrateConfig = CrateConfig {
    crate_id: 0,
    events: vec![EventConfig {
      name: "event0".to_string(),
      trigger: TriggerCondition::Irq { level: 1, iack: true },
      enabled: true,
      modules: vec![ModuleConfig {
        name: "madc32".to_string(),
        readout: vec![
          ScriptCommand::MbltFifo { address: 0x0100_0000, transfers: 100 },
          ScriptCommand::Write { address: 0x6034, value: 1, amod: AddressModifier::A32, width: DataWidth::D16 },
        ],
        reset: vec![],
      }],
    }],
    ..Default::default()
  };

  //STACK COMPILATION
  let builder = config.compile_event_stack(0).unwrap();
  let stack_words: Vec<u32> = builder.encode().unwrap();
  println!("compiled stack for '{}' ({} words):", builder.name(), stack_words.len());
  for word in &stack_words {
    println!("  0x{word:08X}");
  }
  let upload = superc::build_stack_upload(&builder, 1, 1).unwrap();
  println!("upload program: {} buffer(s), trigger value 0x{:02X}",
    upload.len(),
    compute_trigger_value(config.events[0].trigger));

  //SYNTHETIC RUN
  //
  //Write a listfile containing a handful of synthetic readout events, the
  //same shape the controller would produce for the stack above.
  let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
  let mut writer: SplitListfileWriter = SplitListfileWriter::create(
    ListfileWriterConfig {
      output_dir: dir.path().to_path_buf(),
      base_name: "demo_run".to_string(),
      format: ListfileFormat::Usb,
      split: SplitMode::None,
      compress: false,
    },
    &config,
    None,
  )
  .unwrap();
  for event in 0..1000u32 {
    let mut words: Vec<u32> = vec![
      make_stack_frame_header(FrameType::StackFrame, 1, 101, FrameFlags::empty()),
      make_frame_header(FrameType::BlockRead, 100, FrameFlags::empty()),
    ];
    //Channel data words the way an madc32 emits them: 0x1 in the top
    //nibble, channel in bits 16..=19, a 13 bit amplitude.
    for channel in 0..16u32 {
      words.push(0x1000_0000 | (channel << 16) | ((event * 7 + channel * 100) & 0x1FFF));
    }
    words.resize(102, 0x2000_0000);
    writer.write_words(&words).unwrap();
  }
  writer.log_message("synthetic run written");
  let parts = writer.close().unwrap();
  println!("listfile written: {}", parts[0].display());

  //ANALYSIS GRAPH
  //
  //amplitude source -> calibration -> 1d histograms per channel.
  let graph: AnalysisGraph = AnalysisGraph {
    sources: vec![DataSource {
      name: "madc32.amplitude".to_string(),
      event_index: 0,
      module_index: 0,
      filter: DataFilter::compile("0001 XXXX XXXX AAAA XXXD DDDD DDDD DDDD").unwrap(),
    }],
    operators: vec![OperatorDef {
      name: "madc32.cal".to_string(),
      event_index: 0,
      kind: OperatorKind::Calibration { factor: 1.0, offset: 0.0, unit_min: 0.0, unit_max: 8192.0 },
      inputs: vec![Slot::array(NodeRef::Source(0))],
    }],
    sinks: vec![SinkDef {
      name: "madc32.cal.histos".to_string(),
      event_index: 0,
      inputs: vec![Slot::array(NodeRef::Operator(0))],
      kind: SinkKind::Histo1D { bins: 256 },
    }],
    ..Default::default()
  };
  let runtime: AnalysisRuntime = AnalysisRuntime::build(graph, 42).unwrap();
  let sink: Arc<std::sync::Mutex<SinkState>> = runtime.sink_state(0);

  //REPLAY THROUGH THE STREAM WORKER
  let structures = config.readout_structure().unwrap();
  let parser: ReadoutParser = ReadoutParser::new(config.crate_id, structures);
  let replay: WorkerHandle = ReplayWorker::start(parts);
  let stream: StreamWorkerHandle = StreamWorker::start(
    replay.snoop(),
    StreamFormat::Usb,
    RunDescriptor { run_id: "demo_run".to_string(), keep_sink_state: false },
    runtime,
    parser,
    MultiEventSplitter::new(SplitterConfig::default()),
    vec![],
    vec![],
  );

  //WAIT FOR THE REPLAY TO DRAIN
  while stream.counters().physics_events < 1000 {
    std::thread::sleep(Duration::from_millis(20));
  }
  replay.stop(false).unwrap();
  let outcome: StreamOutcome = stream.stop();

  //RESULTS
  let counters = outcome.parser.counters();
  println!(
    "replay done: {} buffers, {} events, {} bytes, {} unused bytes",
    counters.buffers_processed, counters.events_completed, counters.bytes_processed, counters.unused_bytes,
  );
  let state = sink.lock().unwrap();
  if let SinkState::Histo1D(histos) = &*state {
    for (channel, histo) in histos.iter().enumerate() {
      let (bin, count) = histo.max_bin();
      println!(
        "channel {channel:2}: {} entries, peak bin {bin} ({count} counts)",
        histo.entry_count,
      );
    }
  }
}
