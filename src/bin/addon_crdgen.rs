use kube::CustomResourceExt;

use addon_operator::resources::addondeploymentconfigs::AddOnDeploymentConfig;
use addon_operator::resources::addontemplates::AddOnTemplate;
use addon_operator::resources::clustermanagementaddons::ClusterManagementAddOn;
use addon_operator::resources::managedclusteraddons::ManagedClusterAddOn;

fn main() {
    for crd in [
        ClusterManagementAddOn::crd(),
        ManagedClusterAddOn::crd(),
        AddOnDeploymentConfig::crd(),
        AddOnTemplate::crd(),
    ] {
        print!("---\n{}", serde_yaml::to_string(&crd).unwrap());
    }
}
