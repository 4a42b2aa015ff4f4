use crate::core::config::{L2Regularizer, TrainConfig};
use crate::core::schedule::LrSchedule;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

/// Scalars produced by one optimisation step.
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    pub total: f32,
    pub epe: f32,
    pub regularization: f32,
    pub learning_rate: f64,
}

/// Loss assembly plus Adam with a scheduled learning rate.
pub struct TrainOp {
    opt: AdamW,
    schedule: LrSchedule,
    regularizer: Option<L2Regularizer>,
    weights: Vec<Var>,
}

fn weight_vars(varmap: &VarMap) -> anyhow::Result<Vec<Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("variable map lock poisoned"))?;
    let mut named: Vec<(&String, &Var)> = data
        .iter()
        .filter(|(name, _)| name.ends_with("weight"))
        .collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    Ok(named.into_iter().map(|(_, v)| v.clone()).collect())
}

pub fn create_train_op(varmap: &VarMap, cfg: &TrainConfig) -> anyhow::Result<TrainOp> {
    let params = ParamsAdamW {
        lr: cfg.schedule.learning_rate(0),
        beta1: 0.9,
        beta2: 0.999,
        eps: 1e-8,
        weight_decay: 0.0,
    };
    let opt = AdamW::new(varmap.all_vars(), params)?;
    let weights = match cfg.weights_reg {
        Some(reg) => {
            let w = weight_vars(varmap)?;
            log::info!(
                "L2 regularization {} over {} weight tensors",
                reg.scale,
                w.len()
            );
            w
        }
        None => Vec::new(),
    };
    Ok(TrainOp {
        opt,
        schedule: cfg.schedule.clone(),
        regularizer: cfg.weights_reg,
        weights,
    })
}

impl TrainOp {
    pub fn regularizer(&self) -> Option<L2Regularizer> {
        self.regularizer
    }

    /// `scale * sum(w^2) / 2`, or `None` when regularization is off.
    pub fn regularization(&self) -> candle_core::Result<Option<Tensor>> {
        let Some(reg) = self.regularizer else {
            return Ok(None);
        };
        let mut sum: Option<Tensor> = None;
        for w in &self.weights {
            let sq = w.as_tensor().sqr()?.sum_all()?;
            sum = Some(match sum {
                Some(s) => (s + sq)?,
                None => sq,
            });
        }
        match sum {
            Some(s) => Ok(Some((s * (reg.scale * 0.5))?)),
            None => Ok(None),
        }
    }

    /// Adds regularization to `epe_loss`, sets the learning rate for
    /// `global_step` and applies one Adam update.
    pub fn step(&mut self, epe_loss: &Tensor, global_step: u64) -> anyhow::Result<StepOutput> {
        let learning_rate = self.schedule.learning_rate(global_step);
        self.opt.set_learning_rate(learning_rate);

        let (total, regularization) = match self.regularization()? {
            Some(reg) => {
                let r = reg.to_scalar::<f32>()?;
                ((epe_loss + reg)?, r)
            }
            None => (epe_loss.clone(), 0.0),
        };
        self.opt.backward_step(&total)?;

        let total_scalar = total.to_scalar::<f32>()?;
        if !total_scalar.is_finite() {
            anyhow::bail!("loss diverged at step {global_step}: {total_scalar}");
        }
        Ok(StepOutput {
            total: total_scalar,
            epe: epe_loss.to_scalar::<f32>()?,
            regularization,
            learning_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::Learner;
    use candle_core::{DType, Device};
    use candle_nn::Init;
    use clap::Parser;
    use std::path::Path;

    fn config(args: &[&str]) -> TrainConfig {
        let mut argv = vec!["train"];
        argv.extend_from_slice(args);
        TrainConfig::with_base(&Learner::try_parse_from(argv).unwrap(), Path::new("/"))
    }

    fn varmap() -> VarMap {
        let vm = VarMap::new();
        vm.get((2, 2), "conv.weight", Init::Const(2.0), DType::F32, &Device::Cpu)
            .unwrap();
        vm.get(2, "conv.bias", Init::Const(5.0), DType::F32, &Device::Cpu)
            .unwrap();
        vm
    }

    #[test]
    fn no_regularizer_without_weights_reg() {
        let op = create_train_op(&varmap(), &config(&[])).unwrap();
        assert!(op.regularizer().is_none());
        assert!(op.regularization().unwrap().is_none());
    }

    #[test]
    fn regularizer_uses_exact_coefficient_on_weights_only() {
        let op = create_train_op(&varmap(), &config(&["--weights_reg", "0.1"])).unwrap();
        assert_eq!(op.regularizer(), Some(L2Regularizer { scale: 0.1 }));
        // four weights of 2.0, biases excluded: 0.1 * 16 / 2
        let r = op
            .regularization()
            .unwrap()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((r - 0.8).abs() < 1e-6);
    }

    #[test]
    fn step_uses_scheduled_learning_rate_and_updates_weights() {
        let vm = varmap();
        let mut op = create_train_op(&vm, &config(&["--weights_reg", "0.1"])).unwrap();
        let w = vm.all_vars();
        let loss = w
            .iter()
            .map(|v| v.as_tensor().sum_all().unwrap())
            .reduce(|a, b| (a + b).unwrap())
            .unwrap();
        let out = op.step(&loss, 300_001).unwrap();
        assert_eq!(out.learning_rate, 5e-5);
        assert!((out.regularization - 0.8).abs() < 1e-6);
        assert!((out.total - (out.epe + out.regularization)).abs() < 1e-4);

        let data = vm.data().lock().unwrap();
        let after = data["conv.weight"].as_tensor().flatten_all().unwrap();
        let after = after.to_vec1::<f32>().unwrap();
        assert!(after.iter().all(|v| *v < 2.0));
    }
}
