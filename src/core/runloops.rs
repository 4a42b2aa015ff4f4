use crate::core::config::TrainConfig;
use crate::core::saver::Saver;
use crate::core::summary::{StepTrace, SummaryWriter};
use crate::core::train_op::{create_train_op, StepOutput, TrainOp};
use crate::datasets::augment::apply_augmentation;
use crate::datasets::{get_data, Augmentation, HostBatch};
use crate::models::{full_resolution, get_model, multiscale_epe, FlowNetS};
use anyhow::Context;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

pub fn count_size(vm: &VarMap) -> usize {
    vm.all_vars()
        .iter()
        .map(|v| v.as_tensor().elem_count())
        .sum()
}

fn select_device(cfg: &TrainConfig) -> anyhow::Result<Device> {
    if cfg.use_cpu {
        Ok(Device::Cpu)
    } else {
        Ok(Device::cuda_if_available(0)?)
    }
}

fn install_stop_handler() -> anyhow::Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    ctrlc::set_handler(move || {
        log::warn!("interrupt received, stopping after the current step");
        flag.store(true, Ordering::SeqCst);
    })?;
    Ok(stop)
}

/// Train FlowNet until `max_steps` or Ctrl-C.
pub fn run(cfg: &TrainConfig) -> anyhow::Result<()> {
    cfg.validate()?;
    let device = select_device(cfg)?;
    log::info!("Device: {:?}", device);
    log::info!("datadir: {}", cfg.datadir.display());
    log::info!("logdir: {}", cfg.train_dir().display());
    log::info!(
        "learning rate boundaries {:?}, values {:?}",
        cfg.schedule.boundaries(),
        cfg.schedule.values()
    );

    let batches = get_data(cfg, true)?;
    log::info!("Train dataset len: {}", batches.dataset_len());

    let mut trainer = Trainer::new(cfg, device)?;
    let stop = install_stop_handler()?;
    let loop_time = Instant::now();
    let last_step = trainer.train(batches, &stop)?;
    log::info!(
        "Finished at global step {last_step}, train time: {:5.2?}",
        loop_time.elapsed()
    );
    Ok(())
}

/// Model, optimizer and writers for one run.
pub struct Trainer<'a> {
    cfg: &'a TrainConfig,
    device: Device,
    varmap: VarMap,
    model: FlowNetS,
    train_op: TrainOp,
    saver: Saver,
    summary: SummaryWriter,
    augm: Augmentation,
    global_step: u64,
}

impl<'a> Trainer<'a> {
    /// Builds the model and train op, then restores the newest checkpoint
    /// in the train dir if there is one.
    pub fn new(cfg: &'a TrainConfig, device: Device) -> anyhow::Result<Self> {
        let train_dir = cfg.train_dir();
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = get_model(vb, cfg.model, cfg.drop_rate)?;
        log::info!(
            "varmap size: {:.2}M parameters",
            count_size(&varmap) as f64 / 1e6
        );
        let train_op = create_train_op(&varmap, cfg)?;
        let saver = Saver::new(
            &train_dir,
            cfg.max_checkpoints,
            cfg.keep_checkpoint_every_n_hours,
        )?;
        let summary = SummaryWriter::new(&train_dir, cfg.imgsummary, cfg.img_summary_num)?;

        let mut global_step = 0;
        if let Some((path, step)) = saver.latest_checkpoint() {
            log::info!("loading weights from {:?}", path.display());
            varmap
                .load(&path)
                .with_context(|| format!("restoring {}", path.display()))?;
            global_step = step;
        }

        Ok(Self {
            cfg,
            device,
            varmap,
            model,
            train_op,
            saver,
            summary,
            augm: Augmentation::new(cfg.seed),
            global_step,
        })
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn augmented_batches(&self) -> u64 {
        self.augm.batches()
    }

    /// Blocks until `max_steps` is reached or `stop` is set. Writes a final
    /// checkpoint and returns the last global step.
    pub fn train<I>(&mut self, mut batches: I, stop: &AtomicBool) -> anyhow::Result<u64>
    where
        I: Iterator<Item = anyhow::Result<HostBatch>>,
    {
        let cfg = self.cfg;
        let mut last_summary: Option<Instant> = None;
        let mut last_save = Instant::now();
        let mut window = (Instant::now(), self.global_step);
        let start_step = self.global_step;

        if self.global_step >= cfg.max_steps {
            log::info!(
                "global step {} already reached max_steps {}",
                self.global_step,
                cfg.max_steps
            );
            return Ok(self.global_step);
        }

        while self.global_step < cfg.max_steps && !stop.load(Ordering::SeqCst) {
            let wait = Instant::now();
            let batch = batches.next().context("data stream ended")??;
            let data_wait = wait.elapsed();

            let summarize =
                last_summary.map_or(true, |t| t.elapsed() >= cfg.save_summaries_every);
            let (out, mut trace) = self.train_step(batch, summarize)?;
            trace.data_wait_ms = millis(data_wait);
            let step = self.global_step;

            if summarize {
                self.summary.scalars(
                    step,
                    &[
                        ("loss/total", out.total as f64),
                        ("loss/epe", out.epe as f64),
                        ("loss/regularization", out.regularization as f64),
                        ("learning_rate", out.learning_rate),
                    ],
                )?;
                last_summary = Some(Instant::now());
            }
            if step % cfg.log_every_n_steps == 0 {
                let sec_per_step =
                    window.0.elapsed().as_secs_f64() / (step - window.1).max(1) as f64;
                log::info!(
                    "global step {step}: loss = {:.4} ({:.3} sec/step, lr {:e})",
                    out.total,
                    sec_per_step,
                    out.learning_rate
                );
                window = (Instant::now(), step);
            } else {
                log::debug!("[step {step}] loss: {:?}", out.total);
            }
            if step % cfg.trace_every_n_steps == 0 {
                self.summary.trace(&trace)?;
            }
            if last_save.elapsed() >= cfg.save_interval {
                self.saver.save(&self.varmap, step)?;
                last_save = Instant::now();
            }
        }

        if self.global_step > start_step {
            self.saver.save(&self.varmap, self.global_step)?;
        }
        Ok(self.global_step)
    }

    /// get data -> augmentation -> model -> loss -> update, writing image
    /// summaries along the way when `summarize` is set and images are on.
    fn train_step(
        &mut self,
        mut batch: HostBatch,
        summarize: bool,
    ) -> anyhow::Result<(StepOutput, StepTrace)> {
        let (h, w) = (batch.height, batch.width);
        // summaries and traces are tagged with the step this update completes
        let step = self.global_step + 1;
        let summarize_images = summarize && self.cfg.imgsummary;
        let mut trace = StepTrace {
            step,
            ..Default::default()
        };

        if summarize_images {
            self.summary.image_summary(
                step,
                "A_input",
                Some(&batch.imgs_0),
                Some(&batch.imgs_1),
                Some(&batch.flows),
                h,
                w,
            )?;
        }

        let t = Instant::now();
        let augmented = apply_augmentation(self.cfg.augmentation, &mut batch, &mut self.augm);
        if augmented && summarize_images {
            self.summary.image_summary(
                step,
                "B_after_augm",
                Some(&batch.imgs_0),
                Some(&batch.imgs_1),
                Some(&batch.flows),
                h,
                w,
            )?;
        }
        trace.augmentation_ms = millis(t.elapsed());

        let t = Instant::now();
        let (imgs_0, imgs_1, flows) = batch.to_tensors(&self.device)?;
        let calc_flows = self.model.forward_t(&imgs_0, &imgs_1, true)?;
        let loss = multiscale_epe(&calc_flows, &flows)?;
        trace.forward_ms = millis(t.elapsed());

        if summarize_images {
            let result = full_resolution(&calc_flows, h, w)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            self.summary
                .image_summary(step, "E_result", None, None, Some(&result), h, w)?;
        }

        let t = Instant::now();
        let out = self.train_op.step(&loss, self.global_step)?;
        trace.backward_ms = millis(t.elapsed());
        self.global_step += 1;

        Ok((out, trace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Shape3;
    use crate::core::parser::Learner;
    use crate::core::schedule::LrSchedule;
    use crate::datasets::tests::write_fixture;
    use clap::Parser;

    fn tiny_config(base: &std::path::Path, args: &[&str]) -> TrainConfig {
        let mut argv = vec!["train", "--cpu"];
        argv.extend_from_slice(args);
        let lnr = Learner::try_parse_from(argv).unwrap();
        let mut cfg = TrainConfig::with_base(&lnr, base);
        cfg.batchsize = 2;
        cfg.d_shape_img = Shape3::new(64, 64, 3);
        cfg.d_shape_flow = Shape3::new(64, 64, 2);
        cfg.img_net_shape = Shape3::new(64, 64, 3);
        cfg.flow_net_shape = Shape3::new(64, 64, 2);
        cfg.record_bytes = 12 + 64 * 64 * 8;
        cfg.max_steps = 2;
        cfg.schedule = LrSchedule::constant(cfg.learning_rate);
        cfg.log_every_n_steps = 1;
        cfg.trace_every_n_steps = 2;
        std::fs::create_dir_all(&cfg.datadir).unwrap();
        write_fixture(&cfg.datadir, 3, 64, 64);
        cfg
    }

    #[test]
    fn trains_writes_artifacts_and_resumes() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut cfg = tiny_config(tmp.path(), &["--augmentation", "true"]);
        cfg.validate()?;
        let stop = AtomicBool::new(false);

        let mut trainer = Trainer::new(&cfg, Device::Cpu)?;
        let last = trainer.train(get_data(&cfg, true)?, &stop)?;
        assert_eq!(last, 2);
        assert_eq!(trainer.augmented_batches(), 2);
        drop(trainer);

        let train_dir = cfg.train_dir();
        assert!(train_dir.join("model-2.safetensors").exists());
        assert!(train_dir.join("checkpoint").exists());
        assert!(train_dir.join("events.jsonl").exists());
        assert!(train_dir.join("trace_2.json").exists());
        assert!(train_dir.join("images/A_input").is_dir());
        assert!(train_dir.join("images/B_after_augm").is_dir());
        assert!(train_dir.join("images/E_result").is_dir());
        // first update is step 1 everywhere
        assert!(train_dir.join("images/A_input/00000001_0_img0.png").exists());
        assert!(train_dir.join("images/E_result/00000001_0_flow.png").exists());
        assert_eq!(event_steps(&train_dir)?, vec![1]);

        cfg.max_steps = 3;
        let mut resumed = Trainer::new(&cfg, Device::Cpu)?;
        assert_eq!(resumed.global_step(), 2);
        assert_eq!(resumed.train(get_data(&cfg, true)?, &stop)?, 3);
        assert!(train_dir.join("model-3.safetensors").exists());
        Ok(())
    }

    fn event_steps(train_dir: &std::path::Path) -> anyhow::Result<Vec<u64>> {
        let text = std::fs::read_to_string(train_dir.join("events.jsonl"))?;
        let mut steps = Vec::new();
        for line in text.lines() {
            let event: serde_json::Value = serde_json::from_str(line)?;
            let step = event["step"].as_u64().context("event without step")?;
            if steps.last() != Some(&step) {
                steps.push(step);
            }
        }
        Ok(steps)
    }

    #[test]
    fn zero_intervals_summarize_and_save_every_step() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut cfg = tiny_config(tmp.path(), &[]);
        cfg.max_steps = 3;
        cfg.max_checkpoints = 2;
        cfg.save_summaries_every = Duration::ZERO;
        cfg.save_interval = Duration::ZERO;
        let stop = AtomicBool::new(false);

        let mut trainer = Trainer::new(&cfg, Device::Cpu)?;
        assert_eq!(trainer.train(get_data(&cfg, true)?, &stop)?, 3);
        drop(trainer);

        let train_dir = cfg.train_dir();
        assert_eq!(event_steps(&train_dir)?, vec![1, 2, 3]);
        for step in 1..=3 {
            let name = format!("images/A_input/{step:08}_0_img0.png");
            assert!(train_dir.join(name).exists(), "no input summary at step {step}");
        }
        assert!(!train_dir.join("model-1.safetensors").exists());
        assert!(train_dir.join("model-2.safetensors").exists());
        assert!(train_dir.join("model-3.safetensors").exists());

        let state = Saver::read_state(&train_dir)?.context("missing checkpoint index")?;
        let kept: Vec<u64> = state.recent.iter().map(|e| e.step).collect();
        assert_eq!(kept, vec![2, 3]);
        Ok(())
    }

    #[test]
    fn no_augmentation_without_flag() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cfg = tiny_config(tmp.path(), &["--imgsummary", "false"]);
        let stop = AtomicBool::new(false);
        let mut trainer = Trainer::new(&cfg, Device::Cpu)?;
        trainer.train(get_data(&cfg, true)?, &stop)?;
        assert_eq!(trainer.augmented_batches(), 0);
        assert!(!cfg.train_dir().join("images").exists());
        Ok(())
    }

    #[test]
    fn stop_flag_ends_the_loop_before_any_step() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let cfg = tiny_config(tmp.path(), &[]);
        let stop = AtomicBool::new(true);
        let mut trainer = Trainer::new(&cfg, Device::Cpu)?;
        assert_eq!(trainer.train(get_data(&cfg, true)?, &stop)?, 0);
        assert!(!cfg.train_dir().join("checkpoint").exists());
        Ok(())
    }
}
