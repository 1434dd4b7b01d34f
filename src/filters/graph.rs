use log::{debug, error, log, warn, Level};
use std::collections::VecDeque;

use super::{create_stage, Control, ControlReply, Negotiation, Stage, StageArgs};
use crate::config::FilterSpec;
use crate::error::FilterError;
use crate::models::{AudioFormat, AudioFrame};

/// Arena slot of the input sentinel
pub const INPUT: usize = 0;
/// Arena slot of the output sentinel
pub const OUTPUT: usize = 1;

/// Label that broadcasts a command to every stage
pub const ALL_LABEL: &str = "all";

/// Initialization state of a filter graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initialized,
    Failed,
}

#[derive(Debug)]
enum StageKind {
    Input,
    Output,
    Filter(Box<dyn Stage>),
    /// Freed slot waiting for reuse
    Vacant,
}

#[derive(Debug)]
struct StageSlot {
    name: String,
    label: Option<String>,
    auto_inserted: bool,
    kind: StageKind,
    fmt_in: AudioFormat,
    fmt_out: AudioFormat,
    /// Requested output before negotiation, actual output after
    data: AudioFormat,
    queue: VecDeque<AudioFrame>,
    prev: Option<usize>,
    next: Option<usize>,
}

impl StageSlot {
    fn new(name: &str, kind: StageKind) -> Self {
        Self {
            name: name.to_string(),
            label: None,
            auto_inserted: false,
            kind,
            fmt_in: AudioFormat::unset(),
            fmt_out: AudioFormat::unset(),
            data: AudioFormat::unset(),
            queue: VecDeque::new(),
            prev: None,
            next: None,
        }
    }

    fn info(&self) -> StageInfo {
        StageInfo {
            name: self.name.clone(),
            label: self.label.clone(),
            auto_inserted: self.auto_inserted,
            fmt_in: self.fmt_in.clone(),
            fmt_out: self.fmt_out.clone(),
            queued_frames: self.queue.len(),
        }
    }
}

/// Snapshot of one stage for inspection
#[derive(Debug, Clone, PartialEq)]
pub struct StageInfo {
    pub name: String,
    pub label: Option<String>,
    pub auto_inserted: bool,
    pub fmt_in: AudioFormat,
    pub fmt_out: AudioFormat,
    pub queued_frames: usize,
}

/// Outcome of reinitializing one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reinit {
    Ok,
    Mismatch,
    Detach,
}

/// Ordered chain of filter stages between two fixed sentinels.
///
/// Stages live in an index arena; `INPUT` and `OUTPUT` never move. The graph owns
/// format negotiation, inserts conversion stages on its own, queues frames between
/// stages and routes control messages.
#[derive(Debug)]
pub struct FilterGraph {
    slots: Vec<StageSlot>,
    free: Vec<usize>,
    input: AudioFormat,
    output: AudioFormat,
    filter_output: AudioFormat,
    state: InitState,
    configured: Vec<FilterSpec>,
}

impl FilterGraph {
    /// Create an empty, uninitialized graph that will build `filters` on first initialization
    pub fn new(filters: Vec<FilterSpec>) -> Self {
        let mut input = StageSlot::new("in", StageKind::Input);
        let mut output = StageSlot::new("out", StageKind::Output);
        input.next = Some(OUTPUT);
        output.prev = Some(INPUT);

        Self {
            slots: vec![input, output],
            free: Vec::new(),
            input: AudioFormat::unset(),
            output: AudioFormat::unset(),
            filter_output: AudioFormat::unset(),
            state: InitState::Uninitialized,
            configured: filters,
        }
    }

    pub fn state(&self) -> InitState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == InitState::Initialized
    }

    pub fn input_format(&self) -> &AudioFormat {
        &self.input
    }

    /// Target output format, with unset fields filled after negotiation
    pub fn output_format(&self) -> &AudioFormat {
        &self.output
    }

    /// Format the chain naturally produces
    pub fn filter_output(&self) -> &AudioFormat {
        &self.filter_output
    }

    /// Pin the output to what the device actually opened with.
    ///
    /// Marks the graph for renegotiation if the chain does not already produce it.
    pub fn set_output_format(&mut self, format: AudioFormat) {
        self.output = format;
        if self.output != self.filter_output {
            self.state = InitState::Uninitialized;
        }
    }

    /// Force a renegotiation on the next initialization
    pub fn mark_uninitialized(&mut self) {
        if self.state == InitState::Initialized {
            self.state = InitState::Uninitialized;
        }
    }

    /// Set formats and negotiate.
    ///
    /// On the first call the configured stages are created; later calls renegotiate
    /// the existing stage list.
    pub fn initialize(
        &mut self,
        input: AudioFormat,
        output_hint: AudioFormat,
    ) -> Result<(), FilterError> {
        self.input = input;
        self.output = output_hint;

        if self.slots[INPUT].next == Some(OUTPUT) {
            let configured = self.configured.clone();
            for spec in configured.iter().filter(|spec| spec.enabled) {
                match create_stage(&spec.name, &spec.args) {
                    Ok(stage) => {
                        let idx = self.insert_before(OUTPUT, &spec.name, stage);
                        self.slots[idx].label = spec.label.clone();
                    }
                    Err(e) => {
                        error!("Couldn't create audio filter '{}': {}", spec.name, e);
                        self.uninit();
                        self.state = InitState::Failed;
                        return Err(e);
                    }
                }
            }
        }

        if let Err(e) = self.negotiate() {
            error!("Could not create audio filter chain: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Two-pass format negotiation over the current stage list
    pub fn negotiate(&mut self) -> Result<(), FilterError> {
        self.do_reinit(false)?;
        if self.output.is_valid() {
            if let Err(e) = self.do_reinit(true) {
                error!("Failed second pass filter negotiation: {}", e);
                self.do_reinit(false)?;
            }
        }
        Ok(())
    }

    /// Remove every interior stage and forget queued data
    pub fn uninit(&mut self) {
        while let Some(idx) = self.slots[INPUT].next.filter(|idx| *idx != OUTPUT) {
            self.unlink(idx);
        }
        self.forget_frames();
        self.state = InitState::Uninitialized;
    }

    /// Insert a stage at runtime just before the output and renegotiate.
    ///
    /// On failure the stage is removed again and the previous chain restored.
    pub fn add_stage(
        &mut self,
        name: &str,
        label: &str,
        args: &StageArgs,
    ) -> Result<StageInfo, FilterError> {
        if self.find_by_label(label).is_some() {
            return Err(FilterError::DuplicateLabel {
                label: label.to_string(),
            });
        }

        let stage = create_stage(name, args)?;
        let idx = self.insert_before(OUTPUT, name, stage);
        self.slots[idx].label = Some(label.to_string());

        if let Err(e) = self.negotiate() {
            // Best effort restore; the original error is what matters
            if let Err(restore) = self.remove_stage(label) {
                warn!("Could not restore filter chain after failed insert: {}", restore);
            }
            return Err(e);
        }

        // The stage may have detached itself during negotiation
        self.find_by_label(label)
            .ok_or_else(|| FilterError::LabelNotFound {
                label: label.to_string(),
            })
    }

    /// Remove the stage with the given label and renegotiate.
    ///
    /// Returns `Ok(false)` if no such stage exists. If renegotiation fails, the graph
    /// is rebuilt from the configured stage list.
    pub fn remove_stage(&mut self, label: &str) -> Result<bool, FilterError> {
        let Some(idx) = self.find_index(label) else {
            return Ok(false);
        };
        self.unlink(idx);

        if !self.input.is_valid() {
            return Ok(true);
        }

        if let Err(e) = self.negotiate() {
            self.uninit();
            let input = self.input.clone();
            let output = self.output.clone();
            if let Err(rebuild) = self.initialize(input, output) {
                error!("Rebuilding filter chain failed: {}", rebuild);
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Reset every stage and discard queued frames, keeping negotiated formats
    pub fn reset(&mut self) {
        for idx in self.chain() {
            if let StageKind::Filter(stage) = &mut self.slots[idx].kind {
                stage.reset();
            }
        }
        self.forget_frames();
    }

    /// Push a frame into the first stage
    pub fn feed(&mut self, frame: AudioFrame) -> Result<(), FilterError> {
        if self.state != InitState::Initialized {
            return Err(FilterError::NotInitialized);
        }
        if frame.format != self.input {
            return Err(FilterError::InputMismatch {
                expected: self.input.to_string(),
                actual: frame.format.to_string(),
            });
        }
        let first = self.slots[INPUT].next.unwrap_or(OUTPUT);
        self.transform_at(first, Some(frame))
    }

    /// Move frames through the chain until the output has a frame or nothing moves.
    ///
    /// With `eof` set, stages are flushed in order once everything before them has
    /// been drained. Returns whether an output frame is available.
    pub fn drain_step(&mut self, eof: bool) -> Result<bool, FilterError> {
        if !self.slots[OUTPUT].queue.is_empty() {
            return Ok(true);
        }
        if self.state != InitState::Initialized {
            return Err(FilterError::NotInitialized);
        }

        loop {
            let mut last = None;
            let mut cur = Some(INPUT);
            while let Some(idx) = cur {
                if eof && last.is_none() {
                    self.transform_at(idx, None)?;
                }
                if !self.slots[idx].queue.is_empty() {
                    last = Some(idx);
                }
                cur = self.slots[idx].next;
            }

            let Some(last) = last else {
                return Ok(false);
            };
            let Some(next) = self.slots[last].next else {
                return Ok(true);
            };
            if let Some(frame) = self.slots[last].queue.pop_front() {
                self.transform_at(next, Some(frame))?;
            }
        }
    }

    /// Take one finished frame, advancing the chain once if none is ready
    pub fn pop_output(&mut self) -> Result<Option<AudioFrame>, FilterError> {
        if self.slots[OUTPUT].queue.is_empty() && self.is_initialized() {
            self.drain_step(false)?;
        }
        Ok(self.slots[OUTPUT].queue.pop_front())
    }

    /// Seconds of output held inside the chain
    pub fn total_delay(&self) -> f64 {
        self.chain()
            .into_iter()
            .map(|idx| {
                let slot = &self.slots[idx];
                let own = match &slot.kind {
                    StageKind::Filter(stage) => stage.delay(),
                    _ => 0.0,
                };
                own + slot.queue.iter().map(|f| f.duration()).sum::<f64>()
            })
            .sum()
    }

    /// Send a control to every stage
    pub fn control_broadcast(&mut self, control: &Control) {
        for idx in self.chain() {
            if let StageKind::Filter(stage) = &mut self.slots[idx].kind {
                stage.control(control);
            }
        }
    }

    /// Send a control to stages from the last to the first, stopping at the first
    /// one that accepts it
    pub fn control_latest_first(&mut self, control: &Control) -> Option<StageInfo> {
        let mut cur = Some(OUTPUT);
        while let Some(idx) = cur {
            let slot = &mut self.slots[idx];
            if let StageKind::Filter(stage) = &mut slot.kind {
                if stage.control(control) == ControlReply::Ok {
                    return Some(slot.info());
                }
            }
            cur = slot.prev;
        }
        None
    }

    pub fn control_by_label(
        &mut self,
        label: &str,
        control: &Control,
    ) -> Result<ControlReply, FilterError> {
        let idx = self.find_index(label).ok_or_else(|| FilterError::LabelNotFound {
            label: label.to_string(),
        })?;
        match &mut self.slots[idx].kind {
            StageKind::Filter(stage) => Ok(stage.control(control)),
            _ => Ok(ControlReply::Unsupported),
        }
    }

    /// Send a named command to the labelled stage, or to every stage for `all`
    pub fn send_command(
        &mut self,
        label: &str,
        name: &str,
        arg: &str,
    ) -> Result<ControlReply, FilterError> {
        let control = Control::Command {
            name: name.to_string(),
            arg: arg.to_string(),
        };
        if label == ALL_LABEL {
            self.control_broadcast(&control);
            return Ok(ControlReply::Ok);
        }
        self.control_by_label(label, &control)
    }

    pub fn find_by_label(&self, label: &str) -> Option<StageInfo> {
        self.find_index(label).map(|idx| self.slots[idx].info())
    }

    /// Interior stages in chain order
    pub fn stages(&self) -> Vec<StageInfo> {
        self.chain()
            .into_iter()
            .filter(|idx| *idx != INPUT && *idx != OUTPUT)
            .map(|idx| self.slots[idx].info())
            .collect()
    }

    pub fn auto_inserted_count(&self) -> usize {
        self.stages().iter().filter(|s| s.auto_inserted).count()
    }

    /// Render the chain, marking `at` as the failing stage
    pub fn describe(&self, at: Option<usize>) -> Vec<String> {
        let mut lines = Vec::new();
        for idx in self.chain() {
            let slot = &self.slots[idx];
            let mut line = format!("  [{}] ", slot.name);
            if let Some(label) = &slot.label {
                line.push_str(&format!("\"{}\" ", label));
            }
            line.push_str(&slot.data.to_string());
            if slot.auto_inserted {
                line.push_str(" [a]");
            }
            if Some(idx) == at {
                line.push_str(" <-");
            }
            lines.push(line);
        }
        lines.push(format!("  [ao] {}", self.output));
        lines
    }

    fn dump(&self, at: Option<usize>, level: Level) {
        if !log::log_enabled!(level) {
            return;
        }
        log!(level, "Audio filter chain:");
        for line in self.describe(at) {
            log!(level, "{}", line);
        }
    }

    fn chain(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.slots.len());
        let mut cur = Some(INPUT);
        while let Some(idx) = cur {
            order.push(idx);
            cur = self.slots[idx].next;
        }
        order
    }

    fn find_index(&self, label: &str) -> Option<usize> {
        self.chain()
            .into_iter()
            .find(|idx| self.slots[*idx].label.as_deref() == Some(label))
    }

    fn prev_of(&self, idx: usize) -> usize {
        self.slots[idx].prev.unwrap_or(INPUT)
    }

    /// Link a new stage in front of `before`. Inserting before the input sentinel
    /// inserts right after it.
    fn insert_before(&mut self, before: usize, name: &str, stage: Box<dyn Stage>) -> usize {
        let before = if before == INPUT {
            self.slots[INPUT].next.unwrap_or(OUTPUT)
        } else {
            before
        };
        let prev = self.prev_of(before);

        let mut slot = StageSlot::new(name, StageKind::Filter(stage));
        slot.prev = Some(prev);
        slot.next = Some(before);

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        };
        self.slots[prev].next = Some(idx);
        self.slots[before].prev = Some(idx);
        idx
    }

    fn insert_converter(&mut self, before: usize, wanted: AudioFormat) -> Result<usize, FilterError> {
        let stage = create_stage("convert", &StageArgs::new())?;
        let idx = self.insert_before(before, "convert", stage);
        self.slots[idx].auto_inserted = true;
        self.slots[idx].data = wanted;
        Ok(idx)
    }

    /// Detach and drop a stage together with its queued frames
    fn unlink(&mut self, idx: usize) {
        if idx == INPUT || idx == OUTPUT {
            return;
        }
        debug!("Removing filter {}", self.slots[idx].name);
        let prev = self.slots[idx].prev;
        let next = self.slots[idx].next;
        if let Some(p) = prev {
            self.slots[p].next = next;
        }
        if let Some(n) = next {
            self.slots[n].prev = prev;
        }
        self.slots[idx] = StageSlot::new("", StageKind::Vacant);
        self.free.push(idx);
    }

    fn remove_auto_inserted(&mut self) {
        let auto: Vec<usize> = self
            .chain()
            .into_iter()
            .filter(|idx| self.slots[*idx].auto_inserted)
            .collect();
        for idx in auto {
            self.unlink(idx);
        }
    }

    fn forget_frames(&mut self) {
        for slot in &mut self.slots {
            slot.queue.clear();
        }
    }

    fn reset_formats(&mut self) {
        for idx in self.chain() {
            if idx != INPUT && idx != OUTPUT {
                self.slots[idx].data = AudioFormat::unset();
            }
        }
    }

    fn transform_at(&mut self, idx: usize, frame: Option<AudioFrame>) -> Result<(), FilterError> {
        let slot = &mut self.slots[idx];
        match &mut slot.kind {
            StageKind::Filter(stage) => stage.transform(frame, &mut slot.queue).map_err(|e| {
                error!("Error filtering frame in {}: {}", slot.name, e);
                e
            }),
            StageKind::Input | StageKind::Output => {
                if let Some(frame) = frame {
                    slot.queue.push_back(frame);
                }
                Ok(())
            }
            StageKind::Vacant => Ok(()),
        }
    }

    /// Offer the previous stage's output to one stage
    fn filter_reinit(&mut self, idx: usize) -> Result<Reinit, FilterError> {
        let prev = self.prev_of(idx);
        let input = self.slots[prev].data.clone();
        let slot = &mut self.slots[idx];

        if !input.is_valid() {
            return Err(FilterError::InvalidFormat {
                stage: slot.name.clone(),
                format: input.to_string(),
            });
        }
        slot.fmt_in = input.clone();

        let answer = match &mut slot.kind {
            StageKind::Filter(stage) => stage.negotiate(&input, &slot.data)?,
            StageKind::Output => {
                let mut filter_output = self.output.clone();
                filter_output.copy_unset_fields_from(&input);
                self.filter_output = filter_output.clone();
                if filter_output == input {
                    Negotiation::Accept(filter_output)
                } else {
                    Negotiation::Mismatch(filter_output)
                }
            }
            StageKind::Input | StageKind::Vacant => Negotiation::Accept(input.clone()),
        };

        match answer {
            Negotiation::Accept(out) => {
                if !out.is_valid() {
                    return Err(FilterError::InvalidFormat {
                        stage: slot.name.clone(),
                        format: out.to_string(),
                    });
                }
                slot.data = out.clone();
                slot.fmt_out = out;
                Ok(Reinit::Ok)
            }
            Negotiation::Mismatch(wanted) => {
                slot.fmt_in = wanted;
                Ok(Reinit::Mismatch)
            }
            Negotiation::Detach => Ok(Reinit::Detach),
        }
    }

    /// Reinit a stage, bridging a format mismatch by retargeting the previous stage
    /// or by inserting a converter in front of it
    fn filter_reinit_with_conversion(&mut self, idx: usize) -> Result<Reinit, FilterError> {
        let mut rv = self.filter_reinit(idx)?;
        if rv != Reinit::Mismatch {
            return Ok(rv);
        }

        let wanted = self.slots[idx].fmt_in.clone();
        let prev = self.prev_of(idx);
        if prev != INPUT && self.slots[prev].data != wanted {
            self.slots[prev].data = wanted.clone();
            rv = self.filter_reinit(prev)?;
            if rv != Reinit::Ok {
                return Ok(rv);
            }
        }

        if self.slots[self.prev_of(idx)].data != wanted {
            let conv = self.insert_converter(idx, wanted)?;
            rv = match self.filter_reinit(conv) {
                Ok(Reinit::Ok) => Reinit::Ok,
                Ok(other) => {
                    self.unlink(conv);
                    other
                }
                Err(e) => {
                    self.unlink(conv);
                    return Err(e);
                }
            };
        }

        if rv == Reinit::Ok {
            rv = self.filter_reinit(idx)?;
        }
        Ok(rv)
    }

    /// Find a channel conversion done by a single trailing auto-inserted stage that
    /// could be moved to the front of the chain
    fn find_output_conversion(&self) -> Option<AudioFormat> {
        if self.state != InitState::Initialized || !self.output.is_valid() {
            return None;
        }
        if self.input.channels.equals_reordered(&self.output.channels) {
            return None;
        }

        let conv = self.slots[OUTPUT].prev?;
        let slot = &self.slots[conv];
        if !slot.auto_inserted {
            return None;
        }
        if !(slot.fmt_in.channels.equals_reordered(&self.input.channels)
            && slot.fmt_out.channels.equals_reordered(&self.output.channels))
        {
            return None;
        }
        let other_changes = self.chain().into_iter().any(|idx| {
            let s = &self.slots[idx];
            idx != conv && s.auto_inserted && !s.fmt_in.channels.equals_reordered(&s.fmt_out.channels)
        });
        if other_changes {
            return None;
        }
        if slot.prev == Some(INPUT) && slot.next == Some(OUTPUT) {
            return None;
        }

        // Only the channel change moves up; rate and encoding stay with the tail
        Some(AudioFormat::new(
            0,
            crate::models::SampleEncoding::Unknown,
            self.output.channels.clone(),
        ))
    }

    fn fail(&mut self, at: Option<usize>) {
        self.state = InitState::Failed;
        self.dump(at, Level::Error);
    }

    fn do_reinit(&mut self, second_pass: bool) -> Result<(), FilterError> {
        let mut convert_early = None;
        if second_pass {
            match self.find_output_conversion() {
                Some(format) => convert_early = Some(format),
                None => return Ok(()),
            }
        }

        self.remove_auto_inserted();
        self.forget_frames();
        self.reset_formats();
        let input = self.input.clone();
        let first = &mut self.slots[INPUT];
        first.fmt_in = input.clone();
        first.fmt_out = input.clone();
        first.data = input;

        if let Some(early) = convert_early {
            let conv = self.insert_converter(INPUT, early)?;
            match self.filter_reinit(conv) {
                Ok(Reinit::Ok) | Ok(Reinit::Detach) => debug!("Moving up output conversion."),
                Ok(Reinit::Mismatch) => {
                    let stage = self.slots[conv].name.clone();
                    self.fail(Some(conv));
                    return Err(FilterError::NegotiationFailed { stage });
                }
                Err(e) => {
                    self.fail(Some(conv));
                    return Err(e);
                }
            }
        }

        let mut cur = self.slots[INPUT].next;
        while let Some(idx) = cur {
            let rv = match self.filter_reinit_with_conversion(idx) {
                Ok(rv) => rv,
                Err(e) => {
                    error!(
                        "Reinitialization did not work, audio filter '{}' returned error: {}",
                        self.slots[idx].name, e
                    );
                    self.fail(Some(idx));
                    return Err(e);
                }
            };

            match rv {
                Reinit::Ok => cur = self.slots[idx].next,
                Reinit::Mismatch => {
                    let prev = self.prev_of(idx);
                    let offered = self.slots[prev].data.encoding;
                    let wanted = self.slots[idx].fmt_in.encoding;
                    if offered.is_known()
                        && wanted.is_known()
                        && offered.is_spdif() != wanted.is_spdif()
                        && self.slots[idx].next.is_some()
                    {
                        warn!(
                            "Filter {} apparently cannot be used due to spdif passthrough - removing it.",
                            self.slots[idx].name
                        );
                        self.unlink(idx);
                        cur = self.slots[prev].next;
                        continue;
                    }
                    error!("Unable to convert audio input format to output format.");
                    let stage = self.slots[idx].name.clone();
                    self.fail(Some(idx));
                    return Err(FilterError::NegotiationFailed { stage });
                }
                Reinit::Detach => {
                    let prev = self.prev_of(idx);
                    self.unlink(idx);
                    cur = self.slots[prev].next;
                }
            }
        }

        // Pin unset output fields to what the chain produces
        let filter_output = self.filter_output.clone();
        self.output.copy_unset_fields_from(&filter_output);
        if self.output == self.filter_output {
            self.state = InitState::Initialized;
            self.dump(None, Level::Debug);
            Ok(())
        } else {
            self.fail(None);
            Err(FilterError::OutputMismatch {
                expected: self.output.to_string(),
                actual: self.filter_output.to_string(),
            })
        }
    }
}
