//! 模拟器内部状态：对象图、磁盘链与任务表

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

use crate::backend::PropertyMap;
use crate::error::{DriverError, QueryError, Result};
use crate::models::property::{
    DiskChainLayer, DiskLayout, HardwareInfo, SnapshotInfo, SnapshotTree, VmConfigInfo,
};
use crate::models::{
    AboutInfo, CloneSpec, ManagedObjectRef, MethodCall, ObjectType, PowerState,
    ResourceAllocationInfo, ServiceContent, SnapshotRequest, TaskInfo, TaskState,
    VirtualMachineConfigSpec,
};

pub(crate) enum Node {
    Folder {
        children: Vec<ManagedObjectRef>,
    },
    Datacenter {
        vm_folder: ManagedObjectRef,
        host_folder: ManagedObjectRef,
        datastore_folder: ManagedObjectRef,
        network_folder: ManagedObjectRef,
    },
    ComputeResource {
        hosts: Vec<ManagedObjectRef>,
        root_pool: Option<ManagedObjectRef>,
        datastores: Vec<ManagedObjectRef>,
    },
    Host {
        datastores: Vec<ManagedObjectRef>,
    },
    ResourcePool {
        owner: ManagedObjectRef,
        pools: Vec<ManagedObjectRef>,
        vms: Vec<ManagedObjectRef>,
    },
    Datastore,
    Network,
    Vm(Box<VmNode>),
}

pub(crate) struct SimObject {
    pub name: String,
    pub parent: Option<ManagedObjectRef>,
    pub node: Node,
}

pub(crate) struct VmNode {
    pub host: Option<ManagedObjectRef>,
    pub pool: Option<ManagedObjectRef>,
    pub home: ManagedObjectRef,
    pub power: PowerState,
    pub template: bool,
    pub config: VmConfigInfo,
    pub disks: Vec<DiskLayout>,
    pub snapshots: Vec<SimSnapshot>,
    pub current_snapshot: Option<ManagedObjectRef>,
    pub ip: Option<String>,
}

#[derive(Clone)]
pub(crate) struct SimSnapshot {
    pub reference: ManagedObjectRef,
    pub name: String,
    pub description: String,
    pub parent: Option<ManagedObjectRef>,

    /// 拍摄时的磁盘链，链接克隆从这里派生
    pub disks: Vec<DiskLayout>,
}

pub(crate) enum Effect {
    Clone {
        source: ManagedObjectRef,
        folder: ManagedObjectRef,
        name: String,
        spec: CloneSpec,
    },
    Reconfigure {
        vm: ManagedObjectRef,
        spec: VirtualMachineConfigSpec,
    },
    Snapshot {
        vm: ManagedObjectRef,
        request: SnapshotRequest,
    },
    PowerOn(ManagedObjectRef),
    PowerOff(ManagedObjectRef),
    Destroy(ManagedObjectRef),
    Fail(String),
}

pub(crate) struct SimTask {
    pub info: TaskInfo,
    pub remaining: u32,
    pub hang: bool,
    pub effect: Option<Effect>,
}

pub(crate) enum Fault {
    Fail(String),
    Hang,
    Uncancelable,
}

pub(crate) struct SimState {
    next_id: u64,
    pub root_folder: ManagedObjectRef,
    pub objects: HashMap<ManagedObjectRef, SimObject>,
    pub tasks: HashMap<String, SimTask>,
    pub username: String,
    pub password: String,
    pub reachable: bool,
    pub guest_tools: bool,
    pub sessions: HashSet<String>,
    pub faults: HashMap<String, VecDeque<Fault>>,
    pub races: HashSet<String>,
    pub task_latency: u32,
    pub invocations: Vec<String>,
}

impl SimState {
    pub fn new(username: &str, password: &str) -> Self {
        let root_folder = ManagedObjectRef::new(ObjectType::Folder, "group-d1");
        let mut objects = HashMap::new();
        objects.insert(
            root_folder.clone(),
            SimObject {
                name: "Datacenters".to_string(),
                parent: None,
                node: Node::Folder {
                    children: Vec::new(),
                },
            },
        );

        Self {
            next_id: 10,
            root_folder,
            objects,
            tasks: HashMap::new(),
            username: username.to_string(),
            password: password.to_string(),
            reachable: true,
            guest_tools: true,
            sessions: HashSet::new(),
            faults: HashMap::new(),
            races: HashSet::new(),
            task_latency: 1,
            invocations: Vec::new(),
        }
    }

    fn allocate(&mut self, kind: ObjectType) -> ManagedObjectRef {
        self.next_id += 1;
        let prefix = match kind {
            ObjectType::Folder => "group-v",
            ObjectType::Datacenter => "datacenter-",
            ObjectType::ComputeResource => "domain-s",
            ObjectType::ClusterComputeResource => "domain-c",
            ObjectType::HostSystem => "host-",
            ObjectType::ResourcePool => "resgroup-",
            ObjectType::Datastore => "datastore-",
            ObjectType::Network => "network-",
            ObjectType::VirtualMachine => "vm-",
            ObjectType::VirtualMachineSnapshot => "snapshot-",
            ObjectType::Task => "task-",
        };
        ManagedObjectRef::new(kind, format!("{}{}", prefix, self.next_id))
    }

    pub fn service_content(&self) -> ServiceContent {
        ServiceContent {
            root_folder: self.root_folder.clone(),
            about: AboutInfo {
                name: "VMware vCenter Server (simulated)".to_string(),
                version: "6.5.0".to_string(),
                api_type: "VirtualCenter".to_string(),
            },
        }
    }

    // ============================================
    // 拓扑构建
    // ============================================

    fn insert(
        &mut self,
        kind: ObjectType,
        name: &str,
        parent: Option<&ManagedObjectRef>,
        node: Node,
    ) -> ManagedObjectRef {
        let reference = self.allocate(kind);
        self.objects.insert(
            reference.clone(),
            SimObject {
                name: name.to_string(),
                parent: parent.cloned(),
                node,
            },
        );
        if let Some(parent) = parent {
            self.link_child(parent, &reference);
        }
        reference
    }

    fn link_child(&mut self, parent: &ManagedObjectRef, child: &ManagedObjectRef) {
        let Some(object) = self.objects.get_mut(parent) else {
            return;
        };
        match &mut object.node {
            Node::Folder { children } => children.push(child.clone()),
            Node::ComputeResource { hosts, .. } if child.kind == ObjectType::HostSystem => {
                hosts.push(child.clone())
            }
            Node::ResourcePool { pools, .. } if child.kind == ObjectType::ResourcePool => {
                pools.push(child.clone())
            }
            _ => {}
        }
    }

    fn unlink_child(&mut self, parent: &ManagedObjectRef, child: &ManagedObjectRef) {
        if let Some(object) = self.objects.get_mut(parent) {
            if let Node::Folder { children } = &mut object.node {
                children.retain(|c| c != child);
            }
        }
    }

    pub fn add_datacenter(&mut self, name: &str) -> ManagedObjectRef {
        let empty = || Node::Folder {
            children: Vec::new(),
        };
        let vm_folder = self.insert(ObjectType::Folder, "vm", None, empty());
        let host_folder = self.insert(ObjectType::Folder, "host", None, empty());
        let datastore_folder = self.insert(ObjectType::Folder, "datastore", None, empty());
        let network_folder = self.insert(ObjectType::Folder, "network", None, empty());

        let root = self.root_folder.clone();
        let datacenter = self.insert(
            ObjectType::Datacenter,
            name,
            Some(&root),
            Node::Datacenter {
                vm_folder: vm_folder.clone(),
                host_folder: host_folder.clone(),
                datastore_folder: datastore_folder.clone(),
                network_folder: network_folder.clone(),
            },
        );

        for folder in [vm_folder, host_folder, datastore_folder, network_folder] {
            if let Some(object) = self.objects.get_mut(&folder) {
                object.parent = Some(datacenter.clone());
            }
        }
        datacenter
    }

    fn datacenter_folders(&self, datacenter: &ManagedObjectRef) -> Option<[ManagedObjectRef; 4]> {
        match &self.objects.get(datacenter)?.node {
            Node::Datacenter {
                vm_folder,
                host_folder,
                datastore_folder,
                network_folder,
            } => Some([
                vm_folder.clone(),
                host_folder.clone(),
                datastore_folder.clone(),
                network_folder.clone(),
            ]),
            _ => None,
        }
    }

    pub fn vm_folder(&self, datacenter: &ManagedObjectRef) -> Option<ManagedObjectRef> {
        self.datacenter_folders(datacenter).map(|[vm, ..]| vm)
    }

    pub fn add_folder(&mut self, parent: &ManagedObjectRef, name: &str) -> ManagedObjectRef {
        self.insert(
            ObjectType::Folder,
            name,
            Some(parent),
            Node::Folder {
                children: Vec::new(),
            },
        )
    }

    /// 数据中心内按名称复用或创建数据存储
    pub fn datastore(&mut self, datacenter: &ManagedObjectRef, name: &str) -> ManagedObjectRef {
        let Some([_, _, datastore_folder, _]) = self.datacenter_folders(datacenter) else {
            return self.insert(ObjectType::Datastore, name, None, Node::Datastore);
        };

        let existing = self.children_of(&datastore_folder).into_iter().find(|c| {
            c.kind == ObjectType::Datastore
                && self.objects.get(c).is_some_and(|o| o.name == name)
        });
        match existing {
            Some(reference) => reference,
            None => self.insert(ObjectType::Datastore, name, Some(&datastore_folder), Node::Datastore),
        }
    }

    /// 独立主机：计算资源 + 主机 + 根资源池
    pub fn add_host(
        &mut self,
        datacenter: &ManagedObjectRef,
        name: &str,
        datastores: &[&str],
    ) -> ManagedObjectRef {
        let mounted: Vec<ManagedObjectRef> = datastores
            .iter()
            .map(|ds| self.datastore(datacenter, ds))
            .collect();
        let host_folder = self
            .datacenter_folders(datacenter)
            .map(|[_, host, _, _]| host);

        let compute_resource = self.insert(
            ObjectType::ComputeResource,
            name,
            host_folder.as_ref(),
            Node::ComputeResource {
                hosts: Vec::new(),
                root_pool: None,
                datastores: mounted.clone(),
            },
        );
        let host = self.insert(
            ObjectType::HostSystem,
            name,
            Some(&compute_resource),
            Node::Host { datastores: mounted },
        );
        let root_pool = self.insert(
            ObjectType::ResourcePool,
            "Resources",
            Some(&compute_resource),
            Node::ResourcePool {
                owner: compute_resource.clone(),
                pools: Vec::new(),
                vms: Vec::new(),
            },
        );
        if let Some(SimObject {
            node: Node::ComputeResource { root_pool: slot, .. },
            ..
        }) = self.objects.get_mut(&compute_resource)
        {
            *slot = Some(root_pool);
        }
        host
    }

    pub fn add_network(&mut self, datacenter: &ManagedObjectRef, name: &str) -> ManagedObjectRef {
        let folder = self
            .datacenter_folders(datacenter)
            .map(|[_, _, _, network]| network);
        self.insert(ObjectType::Network, name, folder.as_ref(), Node::Network)
    }

    pub fn add_vm(
        &mut self,
        folder: &ManagedObjectRef,
        name: &str,
        host: &ManagedObjectRef,
        datastore: &ManagedObjectRef,
    ) -> ManagedObjectRef {
        let pool = self.root_pool_of_host(host);
        let datastore_name = self.name_of(datastore);
        let node = VmNode {
            host: Some(host.clone()),
            pool: pool.clone(),
            home: datastore.clone(),
            power: PowerState::PoweredOff,
            template: false,
            config: VmConfigInfo {
                name: name.to_string(),
                template: false,
                hardware: HardwareInfo {
                    num_cpu: 1,
                    memory_mb: 1024,
                },
                cpu_allocation: ResourceAllocationInfo {
                    reservation: Some(0),
                    limit: Some(-1),
                    expandable_reservation: None,
                },
                memory_allocation: ResourceAllocationInfo {
                    reservation: Some(0),
                    limit: Some(-1),
                    expandable_reservation: None,
                },
                memory_reservation_locked_to_max: false,
            },
            disks: vec![DiskLayout {
                key: 2000,
                chain: vec![DiskChainLayer {
                    file: disk_file(&datastore_name, name, 0),
                    datastore: datastore.clone(),
                }],
            }],
            snapshots: Vec::new(),
            current_snapshot: None,
            ip: None,
        };

        let vm = self.insert(ObjectType::VirtualMachine, name, Some(folder), Node::Vm(Box::new(node)));
        if let Some(pool) = pool {
            self.attach_to_pool(&pool, &vm);
        }
        vm
    }

    fn attach_to_pool(&mut self, pool: &ManagedObjectRef, vm: &ManagedObjectRef) {
        if let Some(SimObject {
            node: Node::ResourcePool { vms, .. },
            ..
        }) = self.objects.get_mut(pool)
        {
            vms.push(vm.clone());
        }
    }

    fn detach_from_pool(&mut self, pool: &ManagedObjectRef, vm: &ManagedObjectRef) {
        if let Some(SimObject {
            node: Node::ResourcePool { vms, .. },
            ..
        }) = self.objects.get_mut(pool)
        {
            vms.retain(|v| v != vm);
        }
    }

    fn root_pool_of_host(&self, host: &ManagedObjectRef) -> Option<ManagedObjectRef> {
        let compute_resource = self.objects.get(host)?.parent.as_ref()?;
        match &self.objects.get(compute_resource)?.node {
            Node::ComputeResource { root_pool, .. } => root_pool.clone(),
            _ => None,
        }
    }

    pub fn name_of(&self, reference: &ManagedObjectRef) -> String {
        self.objects
            .get(reference)
            .map(|o| o.name.clone())
            .unwrap_or_default()
    }

    pub fn children_of(&self, reference: &ManagedObjectRef) -> Vec<ManagedObjectRef> {
        match self.objects.get(reference).map(|o| &o.node) {
            Some(Node::Folder { children }) => children.clone(),
            Some(Node::ComputeResource { hosts, .. }) => hosts.clone(),
            Some(Node::ResourcePool { pools, .. }) => pools.clone(),
            _ => Vec::new(),
        }
    }

    pub fn vm_mut(&mut self, reference: &ManagedObjectRef) -> Result<&mut VmNode> {
        match self.objects.get_mut(reference).map(|o| &mut o.node) {
            Some(Node::Vm(vm)) => Ok(vm),
            _ => Err(DriverError::ObjectNotFound(reference.clone())),
        }
    }

    fn vm(&self, reference: &ManagedObjectRef) -> Result<&VmNode> {
        match self.objects.get(reference).map(|o| &o.node) {
            Some(Node::Vm(vm)) => Ok(vm),
            _ => Err(DriverError::ObjectNotFound(reference.clone())),
        }
    }

    /// 构建拓扑时直接完成快照
    pub fn snapshot_now(
        &mut self,
        vm: &ManagedObjectRef,
        request: &SnapshotRequest,
    ) -> Result<ManagedObjectRef> {
        let latency = std::mem::replace(&mut self.task_latency, 0);
        let task = self.invoke(vm, &MethodCall::CreateSnapshotTask(request.clone()));
        self.task_latency = latency;
        self.invocations.clear();

        let task = task?.ok_or_else(|| DriverError::ObjectNotFound(vm.clone()))?;
        let info = self.task_info(&task)?;
        self.tasks.remove(&task.value);
        info.result.ok_or_else(|| DriverError::Task {
            operation: "CreateSnapshot_Task".to_string(),
            message: info.error.unwrap_or_default(),
        })
    }

    // ============================================
    // 属性
    // ============================================

    pub fn retrieve(&self, obj: &ManagedObjectRef, paths: &[&str]) -> Result<PropertyMap> {
        let object = self
            .objects
            .get(obj)
            .ok_or_else(|| DriverError::ObjectNotFound(obj.clone()))?;

        let mut map = PropertyMap::new();
        for path in paths {
            let value = self
                .property(object, path)
                .ok_or_else(|| QueryError::UnsupportedProperty(path.to_string()))?;
            map.insert(path.to_string(), value);
        }
        Ok(map)
    }

    fn property(&self, object: &SimObject, path: &str) -> Option<Value> {
        match path {
            "name" => return Some(Value::String(object.name.clone())),
            "parent" => return Some(json(&object.parent)),
            _ => {}
        }

        match &object.node {
            Node::Folder { children } => match path {
                "childEntity" => Some(json(children)),
                _ => None,
            },
            Node::Datacenter {
                vm_folder,
                host_folder,
                datastore_folder,
                network_folder,
            } => match path {
                "vmFolder" => Some(json(vm_folder)),
                "hostFolder" => Some(json(host_folder)),
                "datastoreFolder" => Some(json(datastore_folder)),
                "networkFolder" => Some(json(network_folder)),
                _ => None,
            },
            Node::ComputeResource {
                hosts,
                root_pool,
                datastores,
            } => match path {
                "host" => Some(json(hosts)),
                "resourcePool" => Some(json(root_pool)),
                "datastore" => Some(json(datastores)),
                _ => None,
            },
            Node::Host { datastores } => match path {
                "datastore" => Some(json(datastores)),
                _ => None,
            },
            Node::ResourcePool { owner, pools, vms } => match path {
                "owner" => Some(json(owner)),
                "resourcePool" => Some(json(pools)),
                "vm" => Some(json(vms)),
                _ => None,
            },
            Node::Datastore | Node::Network => None,
            Node::Vm(vm) => self.vm_property(&object.name, vm, path),
        }
    }

    fn vm_property(&self, name: &str, vm: &VmNode, path: &str) -> Option<Value> {
        let value = match path {
            "runtime.host" => json(&vm.host),
            "runtime.powerState" => json(&vm.power),
            "resourcePool" => {
                if vm.template {
                    Value::Null
                } else {
                    json(&vm.pool)
                }
            }
            "datastore" => {
                let mut datastores = vec![vm.home.clone()];
                for layer in vm.disks.iter().flat_map(|d| d.chain.iter()) {
                    if !datastores.contains(&layer.datastore) {
                        datastores.push(layer.datastore.clone());
                    }
                }
                json(&datastores)
            }
            "layoutEx.disk" => json(&vm.disks),
            "config" => {
                let mut config = vm.config.clone();
                config.name = name.to_string();
                config.template = vm.template;
                json(&config)
            }
            "config.template" => Value::Bool(vm.template),
            "snapshot" => {
                if vm.snapshots.is_empty() {
                    Value::Null
                } else {
                    json(&SnapshotInfo {
                        current_snapshot: vm.current_snapshot.clone(),
                        root_snapshot_list: snapshot_tree(&vm.snapshots, None),
                    })
                }
            }
            "guest.ipAddress" => json(&vm.ip),
            _ => return None,
        };
        Some(value)
    }

    // ============================================
    // 方法调用
    // ============================================

    pub fn invoke(&mut self, obj: &ManagedObjectRef, call: &MethodCall) -> Result<Option<ManagedObjectRef>> {
        self.invocations.push(call.name().to_string());

        if !self.objects.contains_key(obj) {
            return Err(DriverError::ObjectNotFound(obj.clone()));
        }

        let mut hang = false;
        let mut uncancelable = false;
        if let Some(fault) = self.faults.get_mut(call.name()).and_then(VecDeque::pop_front) {
            match fault {
                Fault::Fail(message) if call.is_task() => {
                    return Ok(Some(self.new_task(call.name(), Effect::Fail(message), false)));
                }
                Fault::Fail(message) => return Err(DriverError::Api(500, message)),
                Fault::Hang => hang = true,
                Fault::Uncancelable => uncancelable = true,
            }
        }

        let created = self.dispatch(obj, call, hang)?;
        if uncancelable {
            if let Some(task) = created.as_ref().filter(|r| r.kind == ObjectType::Task) {
                if let Some(entry) = self.tasks.get_mut(&task.value) {
                    entry.info.cancelable = false;
                }
            }
        }
        Ok(created)
    }

    fn dispatch(
        &mut self,
        obj: &ManagedObjectRef,
        call: &MethodCall,
        hang: bool,
    ) -> Result<Option<ManagedObjectRef>> {
        match call {
            MethodCall::CreateFolder { name } => self.create_folder(obj, name).map(Some),
            MethodCall::CreateResourcePool { name, .. } => self.create_pool(obj, name).map(Some),
            MethodCall::MarkAsTemplate => {
                let vm = self.vm_mut(obj)?;
                if vm.power == PowerState::PoweredOn {
                    return Err(DriverError::InvalidState(format!("{} is powered on", obj)));
                }
                vm.template = true;
                if let Some(pool) = vm.pool.take() {
                    self.detach_from_pool(&pool, obj);
                }
                Ok(None)
            }
            MethodCall::CloneVmTask { folder, name, spec } => {
                self.validate_clone(obj, folder, name, spec)?;
                let effect = Effect::Clone {
                    source: obj.clone(),
                    folder: folder.clone(),
                    name: name.clone(),
                    spec: spec.clone(),
                };
                Ok(Some(self.new_task(call.name(), effect, hang)))
            }
            MethodCall::ReconfigVmTask { spec } => {
                self.refuse_template(obj)?;
                let effect = Effect::Reconfigure {
                    vm: obj.clone(),
                    spec: spec.clone(),
                };
                Ok(Some(self.new_task(call.name(), effect, hang)))
            }
            MethodCall::CreateSnapshotTask(request) => {
                self.refuse_template(obj)?;
                let effect = Effect::Snapshot {
                    vm: obj.clone(),
                    request: request.clone(),
                };
                Ok(Some(self.new_task(call.name(), effect, hang)))
            }
            MethodCall::PowerOnVmTask => {
                self.refuse_template(obj)?;
                Ok(Some(self.new_task(call.name(), Effect::PowerOn(obj.clone()), hang)))
            }
            MethodCall::PowerOffVmTask => {
                self.vm(obj)?;
                Ok(Some(self.new_task(call.name(), Effect::PowerOff(obj.clone()), hang)))
            }
            MethodCall::DestroyTask => {
                if self.vm(obj)?.power == PowerState::PoweredOn {
                    return Err(DriverError::InvalidState(format!(
                        "{} must be powered off before destroy",
                        obj
                    )));
                }
                Ok(Some(self.new_task(call.name(), Effect::Destroy(obj.clone()), hang)))
            }
        }
    }

    fn refuse_template(&self, obj: &ManagedObjectRef) -> Result<()> {
        if self.vm(obj)?.template {
            return Err(DriverError::InvalidState(format!("{} is a template", obj)));
        }
        Ok(())
    }

    fn child_named(&self, parent: &ManagedObjectRef, kind: ObjectType, name: &str) -> Option<ManagedObjectRef> {
        self.children_of(parent)
            .into_iter()
            .find(|c| c.kind == kind && self.name_of(c) == name)
    }

    fn create_folder(&mut self, parent: &ManagedObjectRef, name: &str) -> Result<ManagedObjectRef> {
        if !matches!(self.objects.get(parent).map(|o| &o.node), Some(Node::Folder { .. })) {
            return Err(DriverError::InvalidState(format!("{} is not a folder", parent)));
        }
        if self.child_named(parent, ObjectType::Folder, name).is_some() {
            return Err(DriverError::DuplicateName(name.to_string()));
        }

        let created = self.add_folder(parent, name);
        if self.races.remove(name) {
            return Err(DriverError::DuplicateName(name.to_string()));
        }
        Ok(created)
    }

    fn create_pool(&mut self, parent: &ManagedObjectRef, name: &str) -> Result<ManagedObjectRef> {
        let owner = match self.objects.get(parent).map(|o| &o.node) {
            Some(Node::ResourcePool { owner, .. }) => owner.clone(),
            _ => {
                return Err(DriverError::InvalidState(format!(
                    "{} is not a resource pool",
                    parent
                )))
            }
        };
        if self.child_named(parent, ObjectType::ResourcePool, name).is_some() {
            return Err(DriverError::DuplicateName(name.to_string()));
        }

        let created = self.insert(
            ObjectType::ResourcePool,
            name,
            Some(parent),
            Node::ResourcePool {
                owner,
                pools: Vec::new(),
                vms: Vec::new(),
            },
        );
        if self.races.remove(name) {
            return Err(DriverError::DuplicateName(name.to_string()));
        }
        Ok(created)
    }

    fn validate_clone(
        &self,
        source: &ManagedObjectRef,
        folder: &ManagedObjectRef,
        name: &str,
        spec: &CloneSpec,
    ) -> Result<()> {
        let vm = self.vm(source)?;
        if !matches!(self.objects.get(folder).map(|o| &o.node), Some(Node::Folder { .. })) {
            return Err(DriverError::ObjectNotFound(folder.clone()));
        }
        if self.child_named(folder, ObjectType::VirtualMachine, name).is_some() {
            return Err(DriverError::DuplicateName(name.to_string()));
        }
        for target in [&spec.location.datastore, &spec.location.host, &spec.location.pool]
            .into_iter()
            .flatten()
        {
            if !self.objects.contains_key(target) {
                return Err(DriverError::ObjectNotFound(target.clone()));
            }
        }

        let linked = spec.location.disk_move_type.is_some_and(|t| t.is_linked());
        if linked {
            let snapshot = spec.snapshot.as_ref().ok_or_else(|| {
                DriverError::InvalidState("linked clone requires a snapshot".to_string())
            })?;
            if !vm.snapshots.iter().any(|s| &s.reference == snapshot) {
                return Err(DriverError::ObjectNotFound(snapshot.clone()));
            }
        }
        Ok(())
    }

    // ============================================
    // 任务
    // ============================================

    fn new_task(&mut self, operation: &str, effect: Effect, hang: bool) -> ManagedObjectRef {
        let reference = self.allocate(ObjectType::Task);
        let info = TaskInfo {
            task: reference.clone(),
            description_id: operation.to_string(),
            state: TaskState::Queued,
            result: None,
            error: None,
            cancelable: true,
            progress: Some(0),
        };
        self.tasks.insert(
            reference.value.clone(),
            SimTask {
                info,
                remaining: self.task_latency,
                hang,
                effect: Some(effect),
            },
        );
        reference
    }

    pub fn task_info(&mut self, task: &ManagedObjectRef) -> Result<TaskInfo> {
        let entry = self
            .tasks
            .get_mut(&task.value)
            .ok_or_else(|| DriverError::ObjectNotFound(task.clone()))?;

        if entry.info.state.is_terminal() || entry.hang {
            if entry.hang {
                entry.info.state = TaskState::Running;
            }
            return Ok(entry.info.clone());
        }

        if entry.remaining > 0 {
            entry.remaining -= 1;
            entry.info.state = TaskState::Running;
            entry.info.progress = Some(50);
            return Ok(entry.info.clone());
        }

        let effect = entry.effect.take();
        let outcome = match effect {
            Some(effect) => self.apply(effect),
            None => Ok(None),
        };

        let entry = self
            .tasks
            .get_mut(&task.value)
            .ok_or_else(|| DriverError::ObjectNotFound(task.clone()))?;
        match outcome {
            Ok(result) => {
                entry.info.state = TaskState::Success;
                entry.info.result = result;
            }
            Err(message) => {
                entry.info.state = TaskState::Error;
                entry.info.error = Some(message);
            }
        }
        entry.info.progress = Some(100);
        entry.info.cancelable = false;
        Ok(entry.info.clone())
    }

    pub fn cancel_task(&mut self, task: &ManagedObjectRef) -> Result<()> {
        let entry = self
            .tasks
            .get_mut(&task.value)
            .ok_or_else(|| DriverError::ObjectNotFound(task.clone()))?;
        if !entry.info.state.is_terminal() && !entry.info.cancelable {
            return Err(DriverError::InvalidState(format!(
                "task {} cannot be cancelled",
                task
            )));
        }
        if !entry.info.state.is_terminal() {
            entry.effect = None;
            entry.hang = false;
            entry.info.state = TaskState::Error;
            entry.info.error = Some("canceled".to_string());
            entry.info.cancelable = false;
        }
        Ok(())
    }

    // ============================================
    // 任务效果
    // ============================================

    fn apply(&mut self, effect: Effect) -> std::result::Result<Option<ManagedObjectRef>, String> {
        match effect {
            Effect::Fail(message) => Err(message),
            Effect::Clone {
                source,
                folder,
                name,
                spec,
            } => self.apply_clone(&source, &folder, &name, &spec).map(Some),
            Effect::Reconfigure { vm, spec } => {
                let vm = self.vm_mut(&vm).map_err(|e| e.to_string())?;
                apply_config(vm, &spec);
                Ok(None)
            }
            Effect::Snapshot { vm, request } => self.apply_snapshot(&vm, &request).map(Some),
            Effect::PowerOn(reference) => {
                let tools = self.guest_tools;
                let ip = format!("10.0.0.{}", self.next_id % 250 + 2);
                let vm = self.vm_mut(&reference).map_err(|e| e.to_string())?;
                vm.power = PowerState::PoweredOn;
                if tools {
                    vm.ip = Some(ip);
                }
                Ok(None)
            }
            Effect::PowerOff(reference) => {
                let vm = self.vm_mut(&reference).map_err(|e| e.to_string())?;
                vm.power = PowerState::PoweredOff;
                vm.ip = None;
                Ok(None)
            }
            Effect::Destroy(reference) => {
                let object = self
                    .objects
                    .remove(&reference)
                    .ok_or_else(|| format!("{} no longer exists", reference))?;
                if let Some(parent) = &object.parent {
                    self.unlink_child(parent, &reference);
                }
                if let Node::Vm(vm) = object.node {
                    if let Some(pool) = &vm.pool {
                        self.detach_from_pool(pool, &reference);
                    }
                }
                Ok(None)
            }
        }
    }

    fn apply_clone(
        &mut self,
        source: &ManagedObjectRef,
        folder: &ManagedObjectRef,
        name: &str,
        spec: &CloneSpec,
    ) -> std::result::Result<ManagedObjectRef, String> {
        self.validate_clone(source, folder, name, spec)
            .map_err(|e| e.to_string())?;
        let vm = self.vm(source).map_err(|e| e.to_string())?;

        let datastore = spec
            .location
            .datastore
            .clone()
            .unwrap_or_else(|| vm.home.clone());
        let host = spec.location.host.clone().or_else(|| vm.host.clone());
        let linked = spec.location.disk_move_type.is_some_and(|t| t.is_linked());

        let base_disks = if linked {
            vm.snapshots
                .iter()
                .find(|s| Some(&s.reference) == spec.snapshot.as_ref())
                .map(|s| s.disks.clone())
                .unwrap_or_default()
        } else {
            vm.disks.clone()
        };
        let config = vm.config.clone();
        let datastore_name = self.name_of(&datastore);

        let disks = base_disks
            .into_iter()
            .map(|disk| {
                let chain = if linked {
                    let mut chain = disk.chain.clone();
                    chain.push(DiskChainLayer {
                        file: disk_file(&datastore_name, name, chain.len()),
                        datastore: datastore.clone(),
                    });
                    chain
                } else {
                    vec![DiskChainLayer {
                        file: disk_file(&datastore_name, name, 0),
                        datastore: datastore.clone(),
                    }]
                };
                DiskLayout {
                    key: disk.key,
                    chain,
                }
            })
            .collect();

        let pool = spec
            .location
            .pool
            .clone()
            .or_else(|| host.as_ref().and_then(|h| self.root_pool_of_host(h)));

        let node = VmNode {
            host,
            pool: pool.clone(),
            home: datastore,
            power: PowerState::PoweredOff,
            template: spec.template,
            config,
            disks,
            snapshots: Vec::new(),
            current_snapshot: None,
            ip: None,
        };

        let created = self.insert(
            ObjectType::VirtualMachine,
            name,
            Some(folder),
            Node::Vm(Box::new(node)),
        );
        if let Some(pool) = pool.filter(|_| !spec.template) {
            self.attach_to_pool(&pool, &created);
        }
        if spec.power_on && !spec.template {
            if let Ok(vm) = self.vm_mut(&created) {
                vm.power = PowerState::PoweredOn;
            }
        }
        Ok(created)
    }

    fn apply_snapshot(
        &mut self,
        reference: &ManagedObjectRef,
        request: &SnapshotRequest,
    ) -> std::result::Result<ManagedObjectRef, String> {
        let snapshot = self.allocate(ObjectType::VirtualMachineSnapshot);
        let name = self.name_of(reference);

        let home = self.vm(reference).map_err(|e| e.to_string())?.home.clone();
        let home_name = self.name_of(&home);

        let vm = self.vm_mut(reference).map_err(|e| e.to_string())?;
        vm.snapshots.push(SimSnapshot {
            reference: snapshot.clone(),
            name: request.name.clone(),
            description: request.description.clone(),
            parent: vm.current_snapshot.clone(),
            disks: vm.disks.clone(),
        });
        vm.current_snapshot = Some(snapshot.clone());

        for disk in &mut vm.disks {
            let index = disk.chain.len();
            disk.chain.push(DiskChainLayer {
                file: disk_file(&home_name, &name, index),
                datastore: home.clone(),
            });
        }
        Ok(snapshot)
    }
}

/// 把重配置规格合并进虚拟机配置
fn apply_config(vm: &mut VmNode, spec: &VirtualMachineConfigSpec) {
    let config = &mut vm.config;
    if let Some(cpus) = spec.num_cpus {
        config.hardware.num_cpu = cpus;
    }
    if let Some(memory) = spec.memory_mb {
        config.hardware.memory_mb = memory;
    }
    if let Some(cpu) = &spec.cpu_allocation {
        merge_allocation(&mut config.cpu_allocation, cpu);
    }
    if let Some(memory) = &spec.memory_allocation {
        merge_allocation(&mut config.memory_allocation, memory);
    }
    if let Some(locked) = spec.memory_reservation_locked_to_max {
        config.memory_reservation_locked_to_max = locked;
    }
    if config.memory_reservation_locked_to_max {
        config.memory_allocation.reservation = Some(config.hardware.memory_mb);
    }
}

fn merge_allocation(target: &mut ResourceAllocationInfo, update: &ResourceAllocationInfo) {
    if update.reservation.is_some() {
        target.reservation = update.reservation;
    }
    if update.limit.is_some() {
        target.limit = update.limit;
    }
    if update.expandable_reservation.is_some() {
        target.expandable_reservation = update.expandable_reservation;
    }
}

fn snapshot_tree(snapshots: &[SimSnapshot], parent: Option<&ManagedObjectRef>) -> Vec<SnapshotTree> {
    snapshots
        .iter()
        .filter(|s| s.parent.as_ref() == parent)
        .map(|s| SnapshotTree {
            snapshot: s.reference.clone(),
            name: s.name.clone(),
            description: s.description.clone(),
            child_snapshot_list: snapshot_tree(snapshots, Some(&s.reference)),
        })
        .collect()
}

fn disk_file(datastore: &str, vm: &str, index: usize) -> String {
    if index == 0 {
        format!("[{}] {}/{}.vmdk", datastore, vm, vm)
    } else {
        format!("[{}] {}/{}-{:06}.vmdk", datastore, vm, vm, index)
    }
}

fn json<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
