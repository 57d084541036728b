//! Minimal end-to-end run: one resident task, two exclusive groups, and a
//! command-driven switch between them.
//!
//! ```sh
//! RUST_LOG=info cargo run --example group_switch
//! ```

use std::sync::Arc;
use std::time::Duration;

use ocm_core::{
    DesiredGroupData, Executer, ExecuterConfig, Node, NodeMap, OcmResult, SharedMemoryTopic,
};

struct Estimator;

impl Node for Estimator {
    fn execute(&mut self) -> OcmResult<()> {
        Ok(())
    }
}

struct PdController {
    gain: f64,
}

impl Node for PdController {
    fn init(&mut self) -> OcmResult<()> {
        self.gain = 35.0;
        log::info!("pd_controller armed with gain {}", self.gain);
        Ok(())
    }

    fn execute(&mut self) -> OcmResult<()> {
        Ok(())
    }

    fn after_exit(&mut self) {
        log::info!("pd_controller released");
    }
}

struct JointDamper;

impl Node for JointDamper {
    fn execute(&mut self) -> OcmResult<()> {
        Ok(())
    }
}

const CONFIG: &str = r#"
executer_setting:
  package_name: ocm_demo
  timer_setting: { timer_type: INTERNAL_TIMER, period: 0.002 }
task_list:
  resident_group:
    estimator:
      task_name: estimator
      node_list:
        - { node_name: estimator, output_enable: true }
      timer_setting: { timer_type: INTERNAL_TIMER, period: 0.002 }
  standby_group:
    stand_control:
      task_name: stand_control
      node_list:
        - { node_name: pd_controller, output_enable: true }
      timer_setting: { timer_type: INTERNAL_TIMER, period: 0.002 }
    damp_control:
      task_name: damp_control
      node_list:
        - { node_name: joint_damper, output_enable: true }
      timer_setting: { timer_type: INTERNAL_TIMER, period: 0.002 }
exclusive_task_group:
  pdstand:
    group_name: pdstand
    task_list:
      stand_control:
        task_name: stand_control
        force_init_node: [pd_controller]
        pre_node: [estimator]
  passive:
    group_name: passive
    task_list:
      damp_control:
        task_name: damp_control
"#;

fn main() -> OcmResult<()> {
    env_logger::init();

    let mut nodes = NodeMap::new();
    nodes.add("estimator", Box::new(Estimator))?;
    nodes.add("pd_controller", Box::new(PdController { gain: 0.0 }))?;
    nodes.add("joint_damper", Box::new(JointDamper))?;

    let config = ExecuterConfig::from_yaml(CONFIG)?;
    let executer = Executer::new(config, Arc::new(nodes), "ocm_desired_group")?;
    executer.create_task()?;
    executer.init_task();

    // Play the external controller: passive first, then stand up.
    let mut commander = SharedMemoryTopic::new();
    for group in ["passive", "pdstand"] {
        commander.publish(
            "ocm_desired_group",
            "ocm_desired_group",
            &DesiredGroupData::new(group),
        )?;
        while executer.current_group() != group {
            std::thread::sleep(Duration::from_millis(5));
        }
        log::info!("active group is now '{}'", executer.current_group());
        std::thread::sleep(Duration::from_millis(200));
    }

    executer.exit_all();
    executer.destroy();
    Ok(())
}
